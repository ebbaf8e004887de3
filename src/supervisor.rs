//! Supervisor loop
//!
//! Every tick: enumerate controllers, start a worker for each identity not yet
//! monitored, then reap workers that have finished. The supervisor is the only
//! writer of the registry, so check-then-register needs no lock. A finished
//! worker stays registered until the reap step, which keeps a second reader
//! from being started on the same node before the first one is gone.

use crate::device::{self, DeviceSource, Identity};
use crate::registry::WorkerRegistry;
use crate::worker::Spawn;
use anyhow::{Context, Result};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// What one cycle changed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub spawned: Vec<Identity>,
    pub reaped: Vec<Identity>,
}

pub struct Supervisor<S, P: Spawn> {
    source: S,
    spawner: P,
    registry: WorkerRegistry<P::Handle>,
    controller_names: Vec<String>,
    interval: Duration,
}

impl<S: DeviceSource, P: Spawn> Supervisor<S, P> {
    pub fn new(
        source: S,
        spawner: P,
        registry: WorkerRegistry<P::Handle>,
        controller_names: Vec<String>,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            spawner,
            registry,
            controller_names,
            interval,
        }
    }

    #[cfg(test)]
    pub fn registry(&self) -> &WorkerRegistry<P::Handle> {
        &self.registry
    }

    /// Run one enumerate -> spawn -> reap pass
    ///
    /// Only a failure to enumerate at all is returned as an error.
    pub fn cycle(&mut self) -> Result<CycleReport> {
        let devices = device::list_controllers(&self.source, &self.controller_names)
            .context("Cannot enumerate input devices")?;

        let mut report = CycleReport::default();

        for device in devices {
            let Some(identity) = self.source.identity(&device) else {
                debug!("No identity for {:?} ('{}'), skipping", device.node, device.name);
                continue;
            };

            if self.registry.is_monitored(&identity) {
                continue;
            }

            match self.spawner.spawn(&device, &identity) {
                Ok(handle) => {
                    if self.registry.register(identity.clone(), handle) {
                        report.spawned.push(identity);
                    }
                }
                Err(e) => warn!("{}: failed to start worker for {:?}: {}", identity, device.node, e),
            }
        }

        report.reaped = self.registry.reap();
        Ok(report)
    }

    /// Cycle on a fixed interval until `shutdown` turns true
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.registry.reset()?;
        info!(
            "Supervisor started (interval {:?}, state in {:?})",
            self.interval,
            self.registry.state_dir()
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.cycle() {
                        Ok(report) => {
                            if report != CycleReport::default() {
                                debug!(
                                    "Cycle: spawned {:?}, reaped {:?}, monitoring {}",
                                    report.spawned,
                                    report.reaped,
                                    self.registry.len()
                                );
                            }
                        }
                        Err(e) => break Err(e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutting down supervisor");
                        break Ok(());
                    }
                }
            }
        };

        if !self.registry.is_empty() {
            info!("Releasing {} monitored controller(s)", self.registry.len());
        }
        self.registry.clear();
        result
    }
}
