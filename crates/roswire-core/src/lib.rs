// roswire-core: device capability surface, registry, and reconnect
// supervision over the roswire-proto transport.

pub mod config;
pub mod device;
pub mod error;
pub mod registry;
pub mod supervisor;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::{DeviceConfig, SupervisorConfig, TlsMode, TransportConfig};
pub use device::{Generation, LegacyRouter, ModernRouter, RouterOps, RouterSession, RowStream};
pub use error::CoreError;
pub use registry::{DeviceRegistry, DeviceStatus, RouterHandle};
pub use supervisor::Supervisor;

// Re-export the request/row vocabulary so consumers need only this crate.
pub use roswire_proto::{Request, RowMap};
