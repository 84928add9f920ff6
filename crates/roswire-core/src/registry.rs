// ── Device registry ──
//
// Maps logical device names to live connections, creating them on demand.
// Connect + authenticate + probe runs as a shared future registered on
// the device record: the first caller starts the attempt, every
// concurrent caller awaits the same future, and nobody holds the registry
// lock across the handshake -- so a slow device never blocks resolution
// of unrelated devices, and no device ever ends up with two sockets.

use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use roswire_proto::{Connection, Request, auth};

use crate::config::DeviceConfig;
use crate::device::{Generation, LegacyRouter, ModernRouter, RouterOps};
use crate::error::CoreError;

/// Shared handle to a connected device.
pub type RouterHandle = Arc<dyn RouterOps>;

type ConnectOutcome = Result<(RouterHandle, Generation), CoreError>;
type ConnectFuture = Shared<BoxFuture<'static, ConnectOutcome>>;

// ── Status ───────────────────────────────────────────────────────────

/// Observable state of one tracked device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub name: String,
    pub connected: bool,
    pub generation: Generation,
    /// The most recent connect or probe failure, cleared on success.
    pub last_error: Option<String>,
}

// ── Registry ─────────────────────────────────────────────────────────

/// The set of managed devices and their live connections.
///
/// Cheaply cloneable; the supervisor and callers share one instance.
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    devices: Mutex<HashMap<String, DeviceRecord>>,
}

struct DeviceRecord {
    config: DeviceConfig,
    /// Detected generation, kept across reconnects.
    generation: Generation,
    router: Option<RouterHandle>,
    /// In-flight connect attempt, tagged so a stale completion cannot
    /// clobber a newer attempt's registration.
    connecting: Option<(u64, ConnectFuture)>,
    attempt_seq: u64,
    last_error: Option<String>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Device set ───────────────────────────────────────────────────

    /// Track a new device. Does not connect -- the first
    /// [`resolve`](Self::resolve) (or the supervisor) does that.
    pub async fn add_device(&self, name: impl Into<String>, config: DeviceConfig) -> Result<(), CoreError> {
        let name = name.into();
        let mut devices = self.inner.devices.lock().await;
        if devices.contains_key(&name) {
            return Err(CoreError::DeviceExists { name });
        }
        debug!(device = %name, host = %config.host, "device added");
        devices.insert(
            name,
            DeviceRecord {
                generation: config.generation,
                config,
                router: None,
                connecting: None,
                attempt_seq: 0,
                last_error: None,
            },
        );
        Ok(())
    }

    /// Stop tracking a device, closing its connection if live.
    pub async fn remove_device(&self, name: &str) -> Result<(), CoreError> {
        let record = {
            let mut devices = self.inner.devices.lock().await;
            devices.remove(name).ok_or_else(|| CoreError::DeviceNotFound {
                name: name.to_string(),
            })?
        };
        if let Some(router) = record.router {
            router.close().await;
        }
        debug!(device = %name, "device removed");
        Ok(())
    }

    // ── Resolution ───────────────────────────────────────────────────

    /// The live handle for a device, connecting (and authenticating, and
    /// probing the generation on first contact) if needed.
    pub async fn resolve(&self, name: &str) -> Result<RouterHandle, CoreError> {
        let (attempt, future) = {
            let mut devices = self.inner.devices.lock().await;
            let record = devices.get_mut(name).ok_or_else(|| CoreError::DeviceNotFound {
                name: name.to_string(),
            })?;

            if let Some(router) = &record.router {
                if router.is_connected() {
                    return Ok(Arc::clone(router));
                }
                // the reader noticed the drop before anyone resolved
                record.router = None;
            }

            match &record.connecting {
                Some((attempt, future)) => (*attempt, future.clone()),
                None => {
                    record.attempt_seq += 1;
                    let attempt = record.attempt_seq;
                    let future = connect_device(name.to_string(), effective_config(record))
                        .boxed()
                        .shared();
                    record.connecting = Some((attempt, future.clone()));
                    (attempt, future)
                }
            }
        };

        let outcome = future.await;

        // Publish the outcome. Every waiter of the same attempt writes the
        // same values; the attempt tag keeps a stale waiter from clearing
        // a newer in-flight registration.
        {
            let mut devices = self.inner.devices.lock().await;
            if let Some(record) = devices.get_mut(name) {
                if record.connecting.as_ref().is_some_and(|(a, _)| *a == attempt) {
                    record.connecting = None;
                    match &outcome {
                        Ok((router, generation)) => {
                            record.router = Some(Arc::clone(router));
                            record.generation = *generation;
                            record.last_error = None;
                        }
                        Err(e) => {
                            record.last_error = Some(e.to_string());
                        }
                    }
                }
            }
        }

        outcome.map(|(router, _)| router)
    }

    // ── Observability ────────────────────────────────────────────────

    /// Status of one tracked device.
    pub async fn status(&self, name: &str) -> Result<DeviceStatus, CoreError> {
        let devices = self.inner.devices.lock().await;
        let record = devices.get(name).ok_or_else(|| CoreError::DeviceNotFound {
            name: name.to_string(),
        })?;
        Ok(record_status(name, record))
    }

    /// Status of every tracked device.
    pub async fn statuses(&self) -> Vec<DeviceStatus> {
        let devices = self.inner.devices.lock().await;
        let mut statuses: Vec<DeviceStatus> = devices
            .iter()
            .map(|(name, record)| record_status(name, record))
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    // ── Supervisor hooks ─────────────────────────────────────────────

    pub(crate) async fn device_names(&self) -> Vec<String> {
        self.inner.devices.lock().await.keys().cloned().collect()
    }

    /// The live handle, if the device currently has one.
    pub(crate) async fn live_router(&self, name: &str) -> Option<RouterHandle> {
        let devices = self.inner.devices.lock().await;
        let record = devices.get(name)?;
        record
            .router
            .as_ref()
            .filter(|router| router.is_connected())
            .map(Arc::clone)
    }

    /// Drop a dead connection and record why.
    pub(crate) async fn mark_disconnected(&self, name: &str, reason: &str) {
        let router = {
            let mut devices = self.inner.devices.lock().await;
            let Some(record) = devices.get_mut(name) else {
                return;
            };
            record.last_error = Some(reason.to_string());
            record.router.take()
        };
        if let Some(router) = router {
            router.close().await;
        }
        warn!(device = %name, reason, "device marked disconnected");
    }
}

fn record_status(name: &str, record: &DeviceRecord) -> DeviceStatus {
    DeviceStatus {
        name: name.to_string(),
        connected: record.router.as_ref().is_some_and(|r| r.is_connected()),
        generation: record.generation,
        last_error: record.last_error.clone(),
    }
}

/// The stored config, with the generation hint upgraded to whatever was
/// detected earlier so reconnects skip the probe and pick the right
/// handshake immediately.
fn effective_config(record: &DeviceRecord) -> DeviceConfig {
    let mut config = record.config.clone();
    if record.generation != Generation::Unknown {
        config.generation = record.generation;
    }
    config
}

// ── Connect sequence ─────────────────────────────────────────────────

/// Open, authenticate, and (when the generation is unknown) probe.
async fn connect_device(name: String, config: DeviceConfig) -> ConnectOutcome {
    debug!(device = %name, host = %config.host, port = config.port, "connecting");

    let conn = Connection::open(&config.host, config.port, &config.transport)
        .await
        .map_err(CoreError::from)?;

    let scheme = config.generation.login_scheme();
    if let Err(e) = auth::login(&conn, &config.username, &config.password, scheme).await {
        conn.close().await;
        return Err(e.into());
    }

    let generation = match config.generation {
        Generation::Unknown => match probe_generation(&conn).await {
            Ok(generation) => generation,
            Err(e) => {
                conn.close().await;
                return Err(e);
            }
        },
        hinted => hinted,
    };

    let router: RouterHandle = match generation {
        Generation::Modern => Arc::new(ModernRouter::new(conn)),
        Generation::Legacy | Generation::Unknown => Arc::new(LegacyRouter::new(conn)),
    };

    info!(device = %name, host = %config.host, %generation, "connected");
    Ok((router, generation))
}

/// Decide the generation from the version the device reports.
async fn probe_generation(conn: &Connection) -> Result<Generation, CoreError> {
    let reply = conn.command(Request::new("/system/resource/print")).await?;
    let version = reply
        .rows
        .first()
        .and_then(|row| row.get("version"))
        .map_or("", String::as_str);

    let generation = Generation::from_version(version);
    if generation == Generation::Unknown {
        // an unparseable version is old firmware until proven otherwise
        warn!(version, "could not classify device version, assuming legacy");
        return Ok(Generation::Legacy);
    }
    Ok(generation)
}
