//! Periodic removal of expired tickets.
//!
//! Native backend TTL is an eviction hint; this sweep is what guarantees that
//! expired tickets are eventually removed. It pages through every catalog
//! kind in bounded batches, so it never holds a registry-wide lock, and a
//! failure on one ticket never stops the sweep.
//!
//! Expired granting tickets are revoked with their descendants; everything
//! else is removed on its own.
//!
//! Nodes sharing one registry coordinate through a [`LockingStrategy`]: a
//! sweep only runs while its cleaner holds the lock, and is skipped otherwise.

use std::{sync::Arc, time::Duration};

use tokio::{
    select,
    sync::watch,
    task::JoinHandle,
    time::{MissedTickBehavior, interval, sleep},
};
use tracing::{debug, info, warn};

use crate::{
    config::{CleanerConfig, DEFAULT_CLEANER_BATCH_SIZE, TicketConfig},
    error::TicketResult,
    locking::{LockingStrategy, NoOpLockingStrategy},
    registry::TicketRegistry,
    revocation::{self, RevocationLimits},
    ticket::{Expirable, Ticket, TicketKind},
};

/// Totals of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Tickets looked at.
    pub examined: usize,
    /// Tickets removed, cascaded descendants included.
    pub removed: usize,
    /// Scans or removals that failed.
    pub failures: usize,
    /// The sweep did not run because another cleaner held the lock.
    pub skipped: bool,
}

/// Sweeps a registry for expired tickets.
#[derive(Debug, bon::Builder)]
pub struct TicketRegistryCleaner {
    registry: Arc<dyn TicketRegistry>,
    #[builder(default)]
    limits: RevocationLimits,
    #[builder(default = DEFAULT_CLEANER_BATCH_SIZE)]
    batch_size: usize,
    #[builder(default = no_locking())]
    locking: Arc<dyn LockingStrategy>,
}

fn no_locking() -> Arc<dyn LockingStrategy> {
    Arc::new(NoOpLockingStrategy)
}

impl TicketRegistryCleaner {
    /// Creates a cleaner using the revocation bounds and batch size of `config`.
    #[must_use]
    pub fn from_config(registry: Arc<dyn TicketRegistry>, config: &TicketConfig) -> Self {
        Self {
            registry,
            limits: RevocationLimits::from(&config.revocation),
            batch_size: config.cleaner.batch_size,
            locking: no_locking(),
        }
    }

    /// Replaces the locking strategy, for clusters sharing one registry.
    #[must_use]
    pub fn with_locking(mut self, locking: Arc<dyn LockingStrategy>) -> Self {
        self.locking = locking;
        self
    }

    /// Runs one sweep over every ticket kind while holding the cleanup lock.
    ///
    /// Never fails: scan and removal errors are logged and counted. When the
    /// lock is held elsewhere the report is marked `skipped`; a lock backend
    /// error also counts as a failure.
    #[tracing::instrument(skip(self))]
    pub async fn clean(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        match self.locking.acquire().await {
            Ok(true) => {},
            Ok(false) => {
                debug!("cleanup lock held by another node; skipping sweep");
                report.skipped = true;
                return report;
            },
            Err(error) => {
                warn!(%error, "failed to acquire cleanup lock; skipping sweep");
                report.skipped = true;
                report.failures += 1;
                return report;
            },
        }

        for kind in TicketKind::ALL {
            self.clean_kind(kind, &mut report).await;
        }
        if let Err(error) = self.locking.release().await {
            warn!(%error, "failed to release cleanup lock; it lapses with its lease");
        }

        if report.removed > 0 || report.failures > 0 {
            info!(
                examined = report.examined,
                removed = report.removed,
                failures = report.failures,
                "ticket cleanup finished",
            );
        } else {
            debug!(examined = report.examined, "ticket cleanup found nothing to remove");
        }
        report
    }

    async fn clean_kind(&self, kind: TicketKind, report: &mut CleanupReport) {
        let mut cursor: Option<String> = None;
        loop {
            let page =
                match self.registry.scan_tickets(kind, cursor.as_deref(), self.batch_size).await {
                    Ok(page) => page,
                    Err(error) => {
                        warn!(%kind, %error, "failed to scan tickets; skipping the rest of this kind");
                        report.failures += 1;
                        return;
                    },
                };

            let now = self.registry.clock().now();
            report.examined += page.tickets.len();
            for ticket in page.tickets.iter().filter(|ticket| ticket.is_expired_at(now)) {
                match self.remove(ticket).await {
                    Ok(removed) => report.removed += removed,
                    Err(error) => {
                        warn!(ticket = %ticket.id(), %error, "failed to remove expired ticket");
                        report.failures += 1;
                    },
                }
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return,
            }
        }
    }

    async fn remove(&self, ticket: &Ticket) -> TicketResult<usize> {
        fail::fail_point!("ticket-cleaner-remove", |_| Err(crate::TicketError::from(
            ticketd_storage::StorageError::connection("injected cleanup failure")
        )));

        if !ticket.kind().is_granting() {
            return self.registry.delete_single_ticket(ticket.id()).await;
        }
        let report = revocation::revoke(self.registry.as_ref(), ticket.id(), self.limits).await?;
        if !report.is_complete() {
            warn!(
                ticket = %ticket.id(),
                unconfirmed = report.unconfirmed.len(),
                "expired ticket revoked with unconfirmed descendants",
            );
        }
        Ok(report.deleted)
    }

    /// Runs [`clean`](Self::clean) on a schedule until the handle is shut down
    /// or dropped.
    ///
    /// Returns `None` when the cleaner is disabled.
    #[must_use]
    pub fn spawn(self: Arc<Self>, config: &CleanerConfig) -> Option<CleanerHandle> {
        if !config.enabled {
            info!("ticket cleaner disabled");
            return None;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(());
        let start_delay = config.start_delay;
        let period = config.interval.max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            select! {
                () = sleep(start_delay) => {},
                _ = shutdown_rx.changed() => return,
            }

            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                select! {
                    _ = ticker.tick() => {
                        self.clean().await;
                    },
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("ticket cleaner stopped");
        });

        Some(CleanerHandle { shutdown_tx, task: Some(task) })
    }
}

/// Handle to a scheduled cleaner. Dropping it stops the schedule.
#[derive(Debug)]
pub struct CleanerHandle {
    shutdown_tx: watch::Sender<()>,
    task: Option<JoinHandle<()>>,
}

impl CleanerHandle {
    /// Stops the schedule and waits for an in-flight sweep to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.task.take() {
            if let Err(error) = task.await {
                warn!(%error, "ticket cleaner task failed");
            }
        }
    }
}

impl Drop for CleanerHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}
