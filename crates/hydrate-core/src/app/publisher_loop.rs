//! PublisherLoop - outbox の drain
//!
//! 未配送の outbox エントリを古い順に配送します。配送済みの重複は claim 側で
//! 弾かれるので、ここは at-least-once で構いません。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::ports::{JobStore, StoreError};

use super::delivery::{Delivery, DeliveryOutcome};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub deferred: usize,
    pub unresolvable: usize,
}

#[derive(Clone)]
pub struct PublisherLoop {
    pub(crate) jobs: Arc<dyn JobStore>,
    pub(crate) delivery: Delivery,
    pub(crate) batch: usize,
    pub(crate) interval: Duration,
}

impl PublisherLoop {
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("publisher started");
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            match self.publish_once().await {
                Ok(report) if report != PublishReport::default() => {
                    tracing::debug!(?report, "outbox drained");
                }
                Ok(_) => {}
                Err(err) => tracing::error!(error = %err, "outbox drain failed"),
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    // sender dropped
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        tracing::info!("publisher stopped");
    }

    /// Deliver up to one batch of undelivered entries.
    pub async fn publish_once(&self) -> Result<PublishReport, StoreError> {
        let mut report = PublishReport::default();
        for entry in self.jobs.undelivered_outbox(self.batch).await? {
            match self.delivery.deliver(&entry, None).await? {
                DeliveryOutcome::Delivered => report.delivered += 1,
                DeliveryOutcome::Deferred(_) => report.deferred += 1,
                DeliveryOutcome::Unresolvable(_) => report.unresolvable += 1,
            }
        }
        Ok(report)
    }
}
