// roswire-proto: wire codec, multiplexed transport, and login handshake
// for the RouterOS binary management API.

pub mod auth;
pub mod codec;
pub mod connection;
pub mod error;
pub mod sentence;
pub mod transport;

pub use auth::LoginScheme;
pub use connection::{CommandReply, CommandStream, Connection};
pub use error::Error;
pub use sentence::{Reply, ReplyKind, Request, RowMap};
pub use transport::{TlsMode, TransportConfig};
