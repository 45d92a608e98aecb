//! Expiration Monitor: periodically reclaims sandboxes whose timer ran out.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::provisioner::Provisioner;

/// Counters of one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub checked: usize,
    pub expired: usize,
    pub failed: usize,
}

pub struct ExpirationMonitor {
    provisioner: Arc<Provisioner>,
    period: Duration,
}

impl ExpirationMonitor {
    pub fn new(provisioner: Arc<Provisioner>, period: Duration) -> Self {
        Self {
            provisioner,
            period,
        }
    }

    /// Run on a background task until `cancel` fires. Await the handle at shutdown.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    /// Scan immediately, then once per period.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period_secs = self.period.as_secs(), "Expiration monitor started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = self.scan(Utc::now()) => {}
                    }
                }
            }
        }
        info!("Expiration monitor stopped");
    }

    /// Check every sandbox against its timer at instant `now`.
    ///
    /// Failures are isolated per sandbox and never abort the scan.
    pub async fn scan(&self, now: DateTime<Utc>) -> ScanReport {
        let mut report = ScanReport::default();
        let users = match self.provisioner.sandbox_users().await {
            Ok(users) => users,
            Err(e) => {
                warn!("Expiration scan could not list sandboxes: {}", e);
                return report;
            }
        };

        for user_id in users {
            report.checked += 1;
            let info = match self.provisioner.sandbox_at(&user_id, now).await {
                Ok(Some(info)) => info,
                Ok(None) => continue,
                Err(e) => {
                    warn!(user_id = %user_id, "Failed to inspect sandbox: {}", e);
                    report.failed += 1;
                    continue;
                }
            };

            if !info.is_expired(now) {
                if let Some(remaining) = info.remaining_time {
                    debug!(user_id = %user_id, workload = %info.pod_name, remaining, "Sandbox within lifetime");
                }
                continue;
            }

            info!(user_id = %user_id, workload = %info.pod_name, expired_at = ?info.expiration_time, "Sandbox expired");
            match self.provisioner.reclaim(&user_id, &info.namespace, now).await {
                Ok(0) => debug!(user_id = %user_id, "No expired workload was removed"),
                Ok(_) => report.expired += 1,
                Err(e) => {
                    warn!(user_id = %user_id, "Failed to reclaim expired sandbox: {}", e);
                    report.failed += 1;
                }
            }
        }

        if report.expired > 0 || report.failed > 0 {
            info!(
                checked = report.checked,
                expired = report.expired,
                failed = report.failed,
                "Expiration scan finished"
            );
        }
        report
    }
}
