// Shared command plumbing under every device variant.
//
// The capability trait's default methods all come through here: typed
// helpers over the raw connection that build requests, unwrap replies,
// and translate errors into the core taxonomy.

use roswire_proto::{Connection, Request, RowMap};

use crate::error::CoreError;

/// One authenticated device session.
#[derive(Debug)]
pub struct RouterSession {
    conn: Connection,
}

impl RouterSession {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// The underlying multiplexed connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Build a request from a path and `(key, value)` parameter pairs.
    fn request(path: &str, params: &[(&str, &str)]) -> Request {
        let mut request = Request::new(path);
        for (key, value) in params {
            request = request.param(key, value);
        }
        request
    }

    /// Run a command, returning all data rows.
    pub(crate) async fn rows(&self, path: &str, params: &[(&str, &str)]) -> Result<Vec<RowMap>, CoreError> {
        Ok(self.conn.command(Self::request(path, params)).await?.rows)
    }

    /// Like [`rows`](Self::rows), with raw query words appended.
    pub(crate) async fn rows_query(
        &self,
        path: &str,
        params: &[(&str, &str)],
        queries: &[String],
    ) -> Result<Vec<RowMap>, CoreError> {
        let mut request = Self::request(path, params);
        for query in queries {
            request = request.query(query);
        }
        Ok(self.conn.command(request).await?.rows)
    }

    /// Run a command with a caller-supplied parameter map, verbatim.
    pub(crate) async fn rows_map(&self, path: &str, params: &RowMap) -> Result<Vec<RowMap>, CoreError> {
        let request = Request::new(path).params(params);
        Ok(self.conn.command(request).await?.rows)
    }

    /// Like [`rows`](Self::rows), but a device-side rejection becomes an
    /// empty list. For optional subsystems (wireless, scripts, ...) that
    /// plenty of boards simply do not have.
    pub(crate) async fn rows_tolerant(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<Vec<RowMap>, CoreError> {
        match self.rows(path, params).await {
            Ok(rows) => Ok(rows),
            Err(CoreError::Device { .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// First data row of a command, or an empty map when there is none.
    pub(crate) async fn first(&self, path: &str, params: &[(&str, &str)]) -> Result<RowMap, CoreError> {
        let mut rows = self.rows(path, params).await?;
        Ok(if rows.is_empty() { RowMap::new() } else { rows.swap_remove(0) })
    }

    /// Like [`first`](Self::first), but a device-side rejection becomes an
    /// empty map.
    pub(crate) async fn first_tolerant(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<RowMap, CoreError> {
        match self.first(path, params).await {
            Ok(row) => Ok(row),
            Err(CoreError::Device { .. }) => Ok(RowMap::new()),
            Err(e) => Err(e),
        }
    }

    /// Run a command for its side effect only.
    pub(crate) async fn exec(&self, path: &str, params: &[(&str, &str)]) -> Result<(), CoreError> {
        self.conn.command(Self::request(path, params)).await?;
        Ok(())
    }

    /// Run a creation command, returning the id of the new entry.
    ///
    /// Current firmware reports it as `ret` on the terminal reply; some
    /// builds echo it on a data row instead, so both are checked.
    pub(crate) async fn create(&self, path: &str, params: &[(&str, &str)]) -> Result<String, CoreError> {
        let reply = self.conn.command(Self::request(path, params)).await?;
        Ok(extract_ret(&reply))
    }

    /// [`create`](Self::create) with a caller-supplied parameter map.
    pub(crate) async fn create_map(&self, path: &str, params: &RowMap) -> Result<String, CoreError> {
        let reply = self.conn.command(Request::new(path).params(params)).await?;
        Ok(extract_ret(&reply))
    }
}

fn extract_ret(reply: &roswire_proto::CommandReply) -> String {
    reply
        .ret()
        .map(ToString::to_string)
        .or_else(|| reply.rows.first().and_then(|row| row.get("ret")).cloned())
        .unwrap_or_default()
}
