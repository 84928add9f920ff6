// The 6.x firmware line.
//
// Everything it can do is the shared surface; the generation-exclusive
// defaults stay in place and report a capability error.

use async_trait::async_trait;

use roswire_proto::Connection;

use super::session::RouterSession;
use super::{Generation, RouterOps};

/// A device on the legacy (6.x) firmware line.
#[derive(Debug)]
pub struct LegacyRouter {
    session: RouterSession,
}

impl LegacyRouter {
    /// Wrap an authenticated connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            session: RouterSession::new(conn),
        }
    }
}

#[async_trait]
impl RouterOps for LegacyRouter {
    fn session(&self) -> &RouterSession {
        &self.session
    }

    fn generation(&self) -> Generation {
        Generation::Legacy
    }
}
