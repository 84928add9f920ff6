// ── Reconnect supervisor ──
//
// Background health checking and reconnection for every tracked device.
// Each sweep probes live connections with a lightweight identity query
// and re-resolves dead ones on an exponential backoff schedule with a
// per-device spread, so a site-wide outage recovering all at once does
// not stampede the routers.
//
// The supervisor never gives up on an unreachable device -- it keeps
// backing off and the registry keeps reporting `last_error` for external
// alerting. The one exception is a credential rejection: retrying bad
// credentials only locks the account, so reconnection halts until the
// device connects again through some other path.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::error::CoreError;
use crate::registry::{DeviceRegistry, RouterHandle};

/// Handle to the running supervision task.
pub struct Supervisor {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    /// Spawn the supervision loop over a registry.
    pub fn start(registry: DeviceRegistry, config: SupervisorConfig) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(registry, config, cancel.clone()));
        Self {
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

// ── Supervision loop ─────────────────────────────────────────────────

/// Per-device reconnect bookkeeping, local to the loop.
struct RetryState {
    attempt: u32,
    next_attempt: Instant,
    /// Set on credential rejection; no further automatic attempts.
    halted: bool,
}

async fn supervise(registry: DeviceRegistry, config: SupervisorConfig, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(config.probe_interval);
    interval.tick().await; // consume the immediate first tick
    let mut retries: HashMap<String, RetryState> = HashMap::new();

    info!(interval_secs = config.probe_interval.as_secs(), "supervisor started");
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        sweep(&registry, &config, &mut retries).await;
    }
    debug!("supervisor stopped");
}

/// One pass over every tracked device: probe the live ones, reconnect the
/// dead ones whose backoff has elapsed. Devices are handled concurrently
/// so one unresponsive router cannot stall the whole sweep.
async fn sweep(
    registry: &DeviceRegistry,
    config: &SupervisorConfig,
    retries: &mut HashMap<String, RetryState>,
) {
    let names = registry.device_names().await;
    retries.retain(|name, _| names.contains(name));

    let now = Instant::now();
    let mut work = Vec::new();

    for name in names {
        if let Some(router) = registry.live_router(&name).await {
            work.push(device_task(registry, config, name, Some(router)));
        } else {
            let due = retries
                .get(&name)
                .is_none_or(|state| !state.halted && now >= state.next_attempt);
            if due {
                work.push(device_task(registry, config, name, None));
            }
        }
    }

    for (name, outcome) in futures::future::join_all(work).await {
        apply_outcome(config, retries, &name, outcome);
    }
}

enum Outcome {
    Healthy,
    ProbeFailed(String),
    Reconnected,
    ReconnectFailed(CoreError),
}

/// Probe a live device or attempt a reconnect, yielding the outcome.
async fn device_task(
    registry: &DeviceRegistry,
    config: &SupervisorConfig,
    name: String,
    router: Option<RouterHandle>,
) -> (String, Outcome) {
    let outcome = match router {
        Some(router) => {
            let verdict = match tokio::time::timeout(config.probe_timeout, router.system_identity()).await {
                Ok(Ok(_)) => None,
                // an error reply still proves the connection is alive
                Ok(Err(e)) if !e.is_connection_level() => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some("health probe timed out".to_string()),
            };
            match verdict {
                None => Outcome::Healthy,
                Some(reason) => {
                    registry.mark_disconnected(&name, &reason).await;
                    Outcome::ProbeFailed(reason)
                }
            }
        }
        None => match registry.resolve(&name).await {
            Ok(_) => Outcome::Reconnected,
            Err(e) => Outcome::ReconnectFailed(e),
        },
    };
    (name, outcome)
}

/// Fold one device's outcome back into the retry schedule.
fn apply_outcome(
    config: &SupervisorConfig,
    retries: &mut HashMap<String, RetryState>,
    name: &str,
    outcome: Outcome,
) {
    match outcome {
        Outcome::Healthy => {
            retries.remove(name);
        }
        Outcome::ProbeFailed(reason) => {
            warn!(device = %name, reason, "health probe failed");
            // first reconnect attempt happens on the next sweep
            retries.insert(
                name.to_string(),
                RetryState {
                    attempt: 0,
                    next_attempt: Instant::now(),
                    halted: false,
                },
            );
        }
        Outcome::Reconnected => {
            info!(device = %name, "device reconnected");
            retries.remove(name);
        }
        Outcome::ReconnectFailed(error) => {
            let halted = matches!(error, CoreError::Auth { .. });
            let state = retries.entry(name.to_string()).or_insert(RetryState {
                attempt: 0,
                next_attempt: Instant::now(),
                halted: false,
            });
            state.halted = halted;
            if halted {
                warn!(device = %name, %error, "credentials rejected; automatic reconnect halted");
            } else {
                let delay = backoff_delay(name, state.attempt, config);
                state.attempt = state.attempt.saturating_add(1);
                state.next_attempt = Instant::now() + delay;
                warn!(
                    device = %name,
                    %error,
                    attempt = state.attempt,
                    delay_ms = delay.as_millis() as u64,
                    "device unreachable, backing off"
                );
            }
        }
    }
}

// ── Backoff calculation ──────────────────────────────────────────────

/// Exponential backoff with a per-device spread.
///
/// `delay = min(initial * 2^attempt, max) * jitter`
///
/// The jitter factor is deterministic, seeded from the device name and
/// attempt number, and spans +-25% -- enough to fan out a fleet that lost
/// power together without needing an RNG.
fn backoff_delay(name: &str, attempt: u32, config: &SupervisorConfig) -> Duration {
    let base = config.initial_backoff.as_secs_f64() * 2.0_f64.powi(attempt.min(16) as i32);
    let capped = base.min(config.max_backoff.as_secs_f64());

    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    let phase = (hasher.finish() % 628) as f64 / 100.0;
    let jitter = 1.0 + 0.25 * (phase + f64::from(attempt) * 7.3).sin();

    Duration::from_secs_f64((capped * jitter).max(0.0))
}

// ── Tests ────────────────────────────────────────────────────────────
