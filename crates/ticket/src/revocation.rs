//! Bounded cascading revocation.
//!
//! Removing a granting ticket also removes everything it minted: its service
//! and proxy tickets, the proxy-granting tickets obtained through those, and
//! so on down the proxy chain. The walk is breadth-first over the child ids
//! recorded on each granting ticket and is capped in both depth and total
//! tickets, since proxy chains are attacker-influenced.
//!
//! The walk tolerates descendants that are already gone (removed by the
//! cleaner or a previous revocation). Descendants it could not remove, or did
//! not reach because a bound was hit, are reported as unconfirmed; the
//! cleaner removes them once they expire on their own.

use std::collections::{HashSet, VecDeque};

use tracing::{debug, warn};

use crate::{
    config::RevocationConfig,
    error::TicketResult,
    registry::TicketRegistry,
};

/// Traversal bounds for [`revoke`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevocationLimits {
    /// Deepest descendant level visited; direct children are depth 1.
    pub max_depth: usize,
    /// Most descendants visited.
    pub max_tickets: usize,
}

impl Default for RevocationLimits {
    fn default() -> Self {
        Self::from(&RevocationConfig::default())
    }
}

impl From<&RevocationConfig> for RevocationLimits {
    fn from(config: &RevocationConfig) -> Self {
        Self { max_depth: config.max_depth, max_tickets: config.max_tickets }
    }
}

/// Outcome of one revocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevocationReport {
    /// Tickets removed, the root included.
    pub deleted: usize,
    /// Descendant ids whose removal could not be confirmed.
    pub unconfirmed: Vec<String>,
    /// Whether a traversal bound stopped the walk early.
    pub truncated: bool,
}

impl RevocationReport {
    /// Whether every reachable descendant was confirmed removed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.unconfirmed.is_empty()
    }
}

/// Removes `id` and every ticket reachable from its recorded children.
///
/// A missing root yields an empty report. Only a failure to read or remove
/// the root itself is an error; descendant failures are collected in
/// [`RevocationReport::unconfirmed`].
///
/// # Errors
///
/// Returns the registry error if the root could not be read or removed.
#[tracing::instrument(skip(registry, limits))]
pub async fn revoke<R>(registry: &R, id: &str, limits: RevocationLimits) -> TicketResult<RevocationReport>
where
    R: TicketRegistry + ?Sized,
{
    let mut report = RevocationReport::default();
    let Some(root) = registry.find_ticket(id).await? else {
        return Ok(report);
    };
    report.deleted += registry.delete_single_ticket(id).await?;

    let mut visited: HashSet<String> = HashSet::from([id.to_owned()]);
    let mut queue: VecDeque<(String, usize)> =
        root.descendant_ids().into_iter().map(|child| (child, 1)).collect();
    let mut visited_descendants = 0usize;

    while let Some((child, depth)) = queue.pop_front() {
        if !visited.insert(child.clone()) {
            continue;
        }
        if depth > limits.max_depth || visited_descendants >= limits.max_tickets {
            report.truncated = true;
            report.unconfirmed.push(child);
            continue;
        }
        visited_descendants += 1;

        match registry.find_ticket(&child).await {
            Ok(Some(ticket)) => {
                queue.extend(ticket.descendant_ids().into_iter().map(|next| (next, depth + 1)));
            },
            Ok(None) => {
                debug!(ticket = %child, "descendant already removed");
                continue;
            },
            Err(error) => {
                warn!(ticket = %child, %error, "failed to read descendant during revocation");
                report.unconfirmed.push(child);
                continue;
            },
        }

        match delete_descendant(registry, &child).await {
            Ok(removed) => report.deleted += removed,
            Err(error) => {
                warn!(ticket = %child, %error, "failed to remove descendant during revocation");
                report.unconfirmed.push(child);
            },
        }
    }

    if report.truncated {
        warn!(
            ticket = %id,
            unvisited = report.unconfirmed.len(),
            "revocation stopped at traversal bound",
        );
    }
    debug!(ticket = %id, deleted = report.deleted, "revoked ticket");
    Ok(report)
}

async fn delete_descendant<R>(registry: &R, id: &str) -> TicketResult<usize>
where
    R: TicketRegistry + ?Sized,
{
    fail::fail_point!("revocation-delete-descendant", |_| Err(crate::TicketError::from(
        ticketd_storage::StorageError::connection("injected descendant delete failure")
    )));
    registry.delete_single_ticket(id).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::{
        registry::MemoryTicketRegistry,
        testutil::{granting_ticket, proxy_granting_ticket, proxy_ticket, service_ticket},
        ticket::Ticket,
    };

    async fn add(registry: &MemoryTicketRegistry, ticket: Ticket) {
        registry.add_ticket(&ticket).await.unwrap();
    }

    /// TGT -> ST -> PGT -> PT, plus a second ST directly on the TGT.
    async fn chain(registry: &MemoryTicketRegistry) {
        let mut tgt = granting_ticket("TGT-1-a", "casuser");
        let mut pgt = proxy_granting_ticket("PGT-1-a", "casuser", "ST-1-a", "TGT-1-a");
        if let Some(t) = tgt.as_granting_mut() {
            t.record_service("ST-1-a", "https://app.example.org");
            t.record_service("ST-2-a", "https://mail.example.org");
            t.proxy_granting_tickets.insert("PGT-1-a".into());
        }
        if let Some(t) = pgt.as_granting_mut() {
            t.record_service("PT-1-a", "https://backend.example.org");
        }
        add(registry, tgt).await;
        add(registry, service_ticket("ST-1-a", "https://app.example.org", "TGT-1-a")).await;
        add(registry, service_ticket("ST-2-a", "https://mail.example.org", "TGT-1-a")).await;
        add(registry, pgt).await;
        add(registry, proxy_ticket("PT-1-a", "https://backend.example.org", "PGT-1-a")).await;
    }

    #[tokio::test]
    async fn removes_whole_tree() {
        let registry = MemoryTicketRegistry::new();
        chain(&registry).await;

        let report = revoke(&registry, "TGT-1-a", RevocationLimits::default()).await.unwrap();

        assert_eq!(report.deleted, 5);
        assert!(report.is_complete());
        assert!(!report.truncated);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn missing_root_is_a_no_op() {
        let registry = MemoryTicketRegistry::new();
        let report = revoke(&registry, "TGT-9-missing", RevocationLimits::default()).await.unwrap();
        assert_eq!(report, RevocationReport::default());
    }

    #[tokio::test]
    async fn tolerates_descendants_already_removed() {
        let registry = MemoryTicketRegistry::new();
        chain(&registry).await;
        registry.delete_single_ticket("ST-2-a").await.unwrap();
        registry.delete_single_ticket("PGT-1-a").await.unwrap();

        let report = revoke(&registry, "TGT-1-a", RevocationLimits::default()).await.unwrap();

        assert_eq!(report.deleted, 2);
        assert!(report.is_complete());
        // Unreachable once its PGT is gone; left for the cleaner.
        assert!(registry.find_ticket("PT-1-a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn depth_bound_truncates_and_reports() {
        let registry = MemoryTicketRegistry::new();
        chain(&registry).await;

        let limits = RevocationLimits { max_depth: 1, max_tickets: 100 };
        let report = revoke(&registry, "TGT-1-a", limits).await.unwrap();

        assert!(report.truncated);
        assert_eq!(report.deleted, 4);
        assert_eq!(report.unconfirmed, vec!["PT-1-a".to_owned()]);
    }

    #[tokio::test]
    async fn ticket_bound_truncates_and_reports() {
        let registry = MemoryTicketRegistry::new();
        chain(&registry).await;

        let limits = RevocationLimits { max_depth: 16, max_tickets: 1 };
        let report = revoke(&registry, "TGT-1-a", limits).await.unwrap();

        assert!(report.truncated);
        assert_eq!(report.deleted, 2);
        assert_eq!(report.unconfirmed.len(), 2);
    }
}
