// The 7.x firmware line.
//
// Shares the whole surface with the legacy variant and overrides the
// parts 7.x reshaped: health reporting moved to name/value rows, routing
// grew a unified `/routing/` tree with BGP/OSPF status, and containers,
// WireGuard, and first-class IPv6 appeared.

use async_trait::async_trait;

use roswire_proto::{Connection, RowMap};

use super::session::RouterSession;
use super::{Generation, RouterOps};
use crate::error::CoreError;

/// A device on the modern (7.x) firmware line.
#[derive(Debug)]
pub struct ModernRouter {
    session: RouterSession,
}

impl ModernRouter {
    /// Wrap an authenticated connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            session: RouterSession::new(conn),
        }
    }
}

#[async_trait]
impl RouterOps for ModernRouter {
    fn session(&self) -> &RouterSession {
        &self.session
    }

    fn generation(&self) -> Generation {
        Generation::Modern
    }

    /// 7.x reports health as `{name, value, type}` rows on most boards;
    /// flatten those into the legacy `key: value` shape so callers see
    /// one format.
    async fn system_health(&self) -> Result<RowMap, CoreError> {
        let rows = self.session.rows_tolerant("/system/health/print", &[]).await?;
        let Some(first) = rows.first() else {
            return Ok(RowMap::new());
        };

        if first.contains_key("name") {
            let mut flat = RowMap::new();
            for row in &rows {
                if let Some(name) = row.get("name") {
                    flat.insert(name.clone(), row.get("value").cloned().unwrap_or_default());
                }
            }
            return Ok(flat);
        }
        Ok(first.clone())
    }

    /// IPv4 static routes plus the IPv6 table, tagged apart with an
    /// `afi` attribute.
    async fn routes(&self) -> Result<Vec<RowMap>, CoreError> {
        let mut routes = self.session.rows("/ip/route/print", &[]).await?;
        let ipv6 = self.session.rows_tolerant("/ipv6/route/print", &[]).await?;
        for mut route in ipv6 {
            route.insert("afi".to_string(), "ipv6".to_string());
            routes.push(route);
        }
        Ok(routes)
    }

    // ── Generation exclusives ────────────────────────────────────────

    async fn containers(&self) -> Result<Vec<RowMap>, CoreError> {
        self.session.rows_tolerant("/container/print", &[]).await
    }

    async fn start_container(&self, id: &str) -> Result<(), CoreError> {
        self.session.exec("/container/start", &[("numbers", id)]).await
    }

    async fn stop_container(&self, id: &str) -> Result<(), CoreError> {
        self.session.exec("/container/stop", &[("numbers", id)]).await
    }

    async fn wireguard_interfaces(&self) -> Result<Vec<RowMap>, CoreError> {
        self.session.rows_tolerant("/interface/wireguard/print", &[]).await
    }

    async fn wireguard_peers(&self) -> Result<Vec<RowMap>, CoreError> {
        self.session.rows_tolerant("/interface/wireguard/peers/print", &[]).await
    }

    async fn bgp_sessions(&self) -> Result<Vec<RowMap>, CoreError> {
        self.session.rows_tolerant("/routing/bgp/session/print", &[]).await
    }

    async fn ospf_instances(&self) -> Result<Vec<RowMap>, CoreError> {
        self.session.rows_tolerant("/routing/ospf/instance/print", &[]).await
    }

    async fn ipv6_addresses(&self) -> Result<Vec<RowMap>, CoreError> {
        self.session.rows_tolerant("/ipv6/address/print", &[]).await
    }
}
