//! Crash supervision for VNC servers and web proxies.
//!
//! Every interval the supervisor reaps exited network servers. Any crash, or a
//! topology left unhealthy by a failed earlier attempt, triggers a full pass
//! of the provisioning pipeline. The pipeline is idempotent, so only the
//! missing pieces are restarted.

use crate::provisioner::Provisioner;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Counters exposed by a running supervisor.
#[derive(Debug, Default)]
pub struct SupervisorStats {
    crashes: AtomicU64,
    recoveries: AtomicU64,
    failed_recoveries: AtomicU64,
}

impl SupervisorStats {
    pub fn crashes(&self) -> u64 {
        self.crashes.load(Ordering::Relaxed)
    }

    pub fn recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::Relaxed)
    }

    pub fn failed_recoveries(&self) -> u64 {
        self.failed_recoveries.load(Ordering::Relaxed)
    }
}

/// Outcome of one supervision tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Healthy,
    Recovered,
    RecoveryFailed,
}

pub struct Supervisor {
    provisioner: Arc<Provisioner>,
    interval: Duration,
    stats: Arc<SupervisorStats>,
}

impl Supervisor {
    pub fn new(provisioner: Arc<Provisioner>, interval: Duration) -> Self {
        Self {
            provisioner,
            interval,
            stats: Arc::new(SupervisorStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SupervisorStats> {
        Arc::clone(&self.stats)
    }

    /// Run a single check.
    pub async fn tick(&self) -> TickOutcome {
        let crashed = self.provisioner.reap_crashed().await;
        for crash in &crashed {
            self.stats.crashes.fetch_add(1, Ordering::Relaxed);
            warn!(
                "{:?} for display :{} (pid {:?}) exited unexpectedly. Last stderr:\n{}",
                crash.role, crash.display_number, crash.pid, crash.stderr_tail
            );
        }

        if crashed.is_empty() && self.provisioner.view().all_ready() {
            return TickOutcome::Healthy;
        }

        info!("Re-running display provisioning");
        match self.provisioner.provision().await {
            Ok(_) => {
                self.stats.recoveries.fetch_add(1, Ordering::Relaxed);
                TickOutcome::Recovered
            }
            Err(e) => {
                // Retried on the next tick
                self.stats.failed_recoveries.fetch_add(1, Ordering::Relaxed);
                error!("Re-provisioning failed: {}", e);
                TickOutcome::RecoveryFailed
            }
        }
    }

    /// Supervise until `shutdown` is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Supervising display servers every {:?}", self.interval);
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Supervisor stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProvisionConfig;
    use crate::host::tcp_listening;
    use crate::testing::{free_ports, FakeHost};

    fn provisioner(host: Arc<FakeHost>, ports: &[u16]) -> Arc<Provisioner> {
        let mut config = ProvisionConfig::default();
        let half = ports.len() / 2;
        config.display.vnc_ports = ports[..half].to_vec();
        config.display.web_ports = ports[half..].to_vec();
        config.readiness.poll_interval_ms = 10;
        config.readiness.port_timeout_secs = 1;
        Arc::new(Provisioner::new(config, host))
    }

    #[tokio::test]
    async fn test_healthy_tick_does_nothing() {
        let ports = free_ports(2);
        let host = Arc::new(FakeHost::new());
        let provisioner = provisioner(host.clone(), &ports);
        provisioner.provision().await.unwrap();
        let spawned = host.spawned().len();

        let supervisor = Supervisor::new(provisioner.clone(), Duration::from_secs(5));
        assert_eq!(supervisor.tick().await, TickOutcome::Healthy);
        assert_eq!(host.spawned().len(), spawned);
        provisioner.shutdown().await;
    }

    #[tokio::test]
    async fn test_crashed_proxy_is_restarted() {
        let ports = free_ports(4);
        let host = Arc::new(FakeHost::new());
        let provisioner = provisioner(host.clone(), &ports);
        provisioner.provision().await.unwrap();

        let web_port = ports[3];
        assert!(host.crash_port(web_port, "websockify: connection reset"));
        assert!(!tcp_listening(web_port).await);

        let supervisor = Supervisor::new(provisioner.clone(), Duration::from_secs(5));
        assert_eq!(supervisor.tick().await, TickOutcome::Recovered);
        assert!(tcp_listening(web_port).await);
        assert!(provisioner.view().all_ready());

        // Only the crashed proxy was relaunched
        let proxies = host
            .spawned()
            .iter()
            .filter(|s| s.program.ends_with("novnc_proxy"))
            .count();
        assert_eq!(proxies, 3);
        assert_eq!(host.live_count("Xvfb"), 2);
        assert_eq!(supervisor.stats().crashes(), 1);
        provisioner.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_recovery_is_retried() {
        let ports = free_ports(2);
        let host = Arc::new(FakeHost::new());
        let provisioner = provisioner(host.clone(), &ports);
        provisioner.provision().await.unwrap();

        host.crash_port(ports[0], "x11vnc: X connection lost");
        host.stall_program("x11vnc", "still broken");
        let supervisor = Supervisor::new(provisioner.clone(), Duration::from_secs(5));
        assert_eq!(supervisor.tick().await, TickOutcome::RecoveryFailed);
        assert!(!provisioner.view().all_ready());

        host.clear_stall("x11vnc");
        assert_eq!(supervisor.tick().await, TickOutcome::Recovered);
        assert!(tcp_listening(ports[0]).await);
        assert_eq!(supervisor.stats().failed_recoveries(), 1);
        provisioner.shutdown().await;
    }

    #[tokio::test]
    async fn test_background_loop_recovers_and_stops() {
        let ports = free_ports(2);
        let host = Arc::new(FakeHost::new());
        let provisioner = provisioner(host.clone(), &ports);
        provisioner.provision().await.unwrap();

        let shutdown = CancellationToken::new();
        let supervisor = Supervisor::new(provisioner.clone(), Duration::from_millis(50));
        let stats = supervisor.stats();
        let handle = supervisor.spawn(shutdown.clone());

        host.crash_port(ports[0], "segfault");
        let stats = &*stats;
        let recovered = crate::readiness::wait_until(
            Duration::from_millis(20),
            Duration::from_secs(3),
            || async move { stats.recoveries() > 0 },
        )
        .await;
        assert!(recovered);
        assert!(tcp_listening(ports[0]).await);

        shutdown.cancel();
        handle.await.unwrap();
        provisioner.shutdown().await;
    }
}
