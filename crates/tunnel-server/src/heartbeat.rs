//! Periodic tunnel maintenance: sweep, limiter reset, master announcement

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::announce::Reporter;
use crate::server::shutdown_requested;
use crate::tunnel::{Protocol, Tunnel};

pub struct HeartbeatScheduler<P: Protocol> {
    tunnel: Arc<Tunnel<P>>,
    reporter: Option<Arc<dyn Reporter>>,
    interval: Duration,
}

impl<P: Protocol> HeartbeatScheduler<P> {
    /// `reporter` is `None` when master announcements are disabled.
    pub fn new(tunnel: Arc<Tunnel<P>>, reporter: Option<Arc<dyn Reporter>>, interval: Duration) -> Self {
        Self {
            tunnel,
            reporter,
            interval,
        }
    }

    /// Tick until shutdown. The first tick runs immediately.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // An announcement in flight must not hold up shutdown
                    tokio::select! {
                        _ = self.tick() => {}
                        _ = shutdown_requested(&mut shutdown) => break,
                    }
                }
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }

        debug!(version = P::VERSION, "heartbeat stopped");
    }

    /// One heartbeat. Report failures are logged and do not affect later ticks.
    pub async fn tick(&self) {
        let evicted = self.tunnel.sweep(Instant::now());
        let announcement = self.tunnel.announcement();

        if evicted > 0 {
            info!(
                version = P::VERSION,
                evicted,
                clients = announcement.clients,
                "evicted timed out clients"
            );
        }
        debug!(
            version = P::VERSION,
            clients = announcement.clients,
            ips = self.tunnel.state().registry.distinct_ips(),
            maintenance = announcement.maintenance,
            "heartbeat"
        );

        if let Some(reporter) = &self.reporter {
            if let Err(e) = reporter.report(&announcement).await {
                warn!(version = P::VERSION, error = %e, "master server announcement failed");
            }
        }
    }
}
