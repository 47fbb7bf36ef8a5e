//! Arbiter Supervisor - tick workers and reversion timers
//!
//! One task per intersection drives [`Arbiter::tick`] on a fixed interval.
//! Each activated override gets a cancellable timer that calls
//! [`Arbiter::expire_override`] at its deadline. Everything hangs off one
//! shutdown token, so [`ArbiterSupervisor::stop`] ends workers and timers
//! together.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::arbiter::{Arbiter, OptimizationOutcome, OptimizationRequest, TickOutcome};
use crate::error::{ArbiterError, Result};
use crate::model::IntersectionId;
use crate::preemption::{Activation, ClearOutcome, EmergencyOutcome, EmergencyRequest, Reversion};

/// Default worker tick interval
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

struct PendingTimer {
    vehicle_id: String,
    token: CancellationToken,
}

/// State shared with spawned workers and timers
struct Shared {
    arbiter: Arc<Arbiter>,
    shutdown: CancellationToken,
    /// Pending reversion timers keyed by override epoch
    timers: DashMap<u64, PendingTimer>,
    /// Latest reported vehicle count per intersection
    vehicle_counts: DashMap<IntersectionId, u32>,
}

impl Shared {
    fn schedule_reversion(self: &Arc<Self>, activation: Activation) {
        let token = self.shutdown.child_token();
        self.timers.insert(
            activation.epoch,
            PendingTimer {
                vehicle_id: activation.vehicle_id.clone(),
                token: token.clone(),
            },
        );

        let wait = (activation.deadline - self.arbiter.now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        debug!(
            "Reversion timer for {} (epoch {}) in {:?}",
            activation.vehicle_id, activation.epoch, wait
        );

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Reversion timer epoch {} cancelled", activation.epoch);
                }
                _ = tokio::time::sleep(wait) => {
                    let now = shared.arbiter.now().max(activation.deadline);
                    match shared.arbiter.expire_override(&activation.group, activation.epoch, now) {
                        Ok(Some(reversion)) => {
                            info!("Override {} expired", reversion.vehicle_id);
                            shared.after_reversion(reversion);
                        }
                        Ok(None) => {}
                        Err(e) => error!("Override expiry for {} failed: {}", activation.vehicle_id, e),
                    }
                }
            }
            shared.timers.remove(&activation.epoch);
        });
    }

    /// Disarm the finished override's timer and arm the promoted one
    fn after_reversion(self: &Arc<Self>, reversion: Reversion) {
        if let Some((_, timer)) = self.timers.remove(&reversion.epoch) {
            timer.token.cancel();
        }
        if let Some(next) = reversion.next_activation {
            info!("Promoted queued emergency {}", next.vehicle_id);
            self.schedule_reversion(next);
        }
    }

    async fn run_worker(self: Arc<Self>, id: IntersectionId, period: Duration, token: CancellationToken) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!("Worker for intersection {} started", id);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let count = self.vehicle_counts.get(&id).map(|c| *c).unwrap_or(0);
                    let now = self.arbiter.now();
                    match self.arbiter.tick(id, now, count) {
                        Ok(TickOutcome::Reverted(reversion)) => self.after_reversion(reversion),
                        Ok(TickOutcome::Faulted { phase, reason }) => {
                            debug!("Intersection {} holding phase {}: {}", id, phase, reason)
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Tick for intersection {} failed: {}", id, e),
                    }
                }
            }
        }
        debug!("Worker for intersection {} stopped", id);
    }
}

/// Runs the arbiter: workers, timers, and the async-facing operations
pub struct ArbiterSupervisor {
    shared: Arc<Shared>,
    tick_interval: Duration,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ArbiterSupervisor {
    pub fn new(arbiter: Arc<Arbiter>, tick_interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                arbiter,
                shutdown: CancellationToken::new(),
                timers: DashMap::new(),
                vehicle_counts: DashMap::new(),
            }),
            tick_interval,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn arbiter(&self) -> &Arc<Arbiter> {
        &self.shared.arbiter
    }

    /// Token cancelled by [`stop`](Self::stop)
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    /// Spawn one worker per registered intersection
    pub fn start(&self) -> Result<usize> {
        if self.tick_interval.is_zero() {
            return Err(ArbiterError::configuration("tick interval must be non-zero"));
        }
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            warn!("Supervisor already running");
            return Ok(workers.len());
        }

        for id in self.shared.arbiter.intersection_ids() {
            let token = self.shared.shutdown.child_token();
            let shared = Arc::clone(&self.shared);
            workers.push(tokio::spawn(shared.run_worker(id, self.tick_interval, token)));
        }
        info!(
            "Arbiter supervisor started {} workers ({:?} tick)",
            workers.len(),
            self.tick_interval
        );
        Ok(workers.len())
    }

    /// Feed the vehicle count used by the intersection's next tick
    pub fn report_vehicle_count(&self, id: IntersectionId, count: i64) -> Result<()> {
        let count = u32::try_from(count).map_err(|_| {
            ArbiterError::validation(format!(
                "vehicle count must be non-negative, got {}",
                count
            ))
        })?;
        self.shared.arbiter.get_runtime_state(id)?;
        self.shared.vehicle_counts.insert(id, count);
        Ok(())
    }

    pub fn apply_optimization(&self, request: OptimizationRequest) -> Result<OptimizationOutcome> {
        let id = request.intersection_id;
        let outcome = self.shared.arbiter.apply_optimization(request)?;
        self.shared.vehicle_counts.insert(id, outcome.vehicle_count);
        Ok(outcome)
    }

    /// Trigger an emergency and arm its reversion timer when activated
    pub fn trigger_emergency(&self, request: EmergencyRequest) -> Result<EmergencyOutcome> {
        let outcome = self.shared.arbiter.trigger_emergency(request)?;
        if let Some(activation) = outcome.activation.clone() {
            self.shared.schedule_reversion(activation);
        }
        Ok(outcome)
    }

    /// Clear an emergency, cancelling its timer
    pub fn clear_emergency(&self, vehicle_id: &str) -> Result<ClearOutcome> {
        let outcome = self.shared.arbiter.clear_emergency(vehicle_id)?;
        if let ClearOutcome::Cleared {
            reversion: Some(reversion),
            ..
        } = &outcome
        {
            self.shared.after_reversion(reversion.clone());
        }
        Ok(outcome)
    }

    /// Vehicles with a reversion timer still armed
    pub fn pending_timers(&self) -> Vec<String> {
        self.shared
            .timers
            .iter()
            .map(|t| t.vehicle_id.clone())
            .collect()
    }

    /// Cancel workers and timers; queued emergencies become CANCELLED
    pub async fn stop(&self) {
        info!("Stopping arbiter supervisor...");
        self.shared.shutdown.cancel();

        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(e) = handle.await {
                warn!("Worker join error: {}", e);
            }
        }
        self.shared.timers.clear();
        let cancelled = self.shared.arbiter.cancel_pending();
        info!(
            "Arbiter supervisor stopped ({} queued emergencies cancelled)",
            cancelled.len()
        );
    }
}
