//! External collaborators of the orchestrator
//!
//! The core depends on a handful of services it does not own. Each one is a
//! trait so the process entry point can inject real implementations and
//! tests can inject deterministic ones:
//!
//! - [`Notifier`] - fire-and-forget dispatch of lifecycle events
//! - [`AdminAuthorizer`] - "may this caller force-cancel" predicate
//! - [`Clock`] - source of the current time
//! - [`IdSource`] - generator of transaction identifiers

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::types::{EscrowError, TransactionId, UserId};

/// Lifecycle events emitted on every state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionEvent {
    RequestCreated {
        transaction: TransactionId,
        seller: UserId,
    },
    Approved {
        transaction: TransactionId,
        buyer: UserId,
    },
    PaymentAuthorized {
        transaction: TransactionId,
        seller: UserId,
    },
    Completed {
        transaction: TransactionId,
        buyer: UserId,
        seller: UserId,
    },
    Cancelled {
        transaction: TransactionId,
        buyer: UserId,
        seller: UserId,
    },
}

impl TransactionEvent {
    pub fn transaction(&self) -> &str {
        match self {
            TransactionEvent::RequestCreated { transaction, .. }
            | TransactionEvent::Approved { transaction, .. }
            | TransactionEvent::PaymentAuthorized { transaction, .. }
            | TransactionEvent::Completed { transaction, .. }
            | TransactionEvent::Cancelled { transaction, .. } => transaction,
        }
    }
}

/// Fire-and-forget notification dispatch
///
/// Delivery, templates and retries belong to the implementation; the core
/// never waits on or inspects the outcome.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: TransactionEvent);
}

/// Notifier that only logs events
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: TransactionEvent) {
        info!(transaction = event.transaction(), ?event, "notification dispatched");
    }
}

/// Notifier that keeps every event, for assertions
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<TransactionEvent>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TransactionEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: TransactionEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Decides whether a caller may force-cancel transactions
pub trait AdminAuthorizer: Send + Sync {
    fn is_admin(&self, user: &str) -> bool;
}

/// Fixed set of operator identities
#[derive(Debug, Default, Clone)]
pub struct StaticAdmins {
    admins: HashSet<UserId>,
}

impl StaticAdmins {
    pub fn new<I, S>(admins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<UserId>,
    {
        Self {
            admins: admins.into_iter().map(Into::into).collect(),
        }
    }

    pub fn grant(&mut self, user: impl Into<UserId>) {
        self.admins.insert(user.into());
    }
}

impl AdminAuthorizer for StaticAdmins {
    fn is_admin(&self, user: &str) -> bool {
        self.admins.contains(user)
    }
}

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward by `by` and return the new time
    ///
    /// The clock is left untouched if the result falls outside the
    /// representable range.
    pub fn advance(&self, by: Duration) -> Result<DateTime<Utc>, EscrowError> {
        let mut now = self
            .now
            .lock()
            .map_err(|_| EscrowError::internal("manual clock lock poisoned"))?;
        let next = now.checked_add_signed(by).ok_or_else(|| {
            EscrowError::invalid_argument(format!("cannot advance clock from {} by {}", *now, by))
        })?;
        *now = next;
        Ok(next)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
            .lock()
            .map(|now| *now)
            .unwrap_or_else(|poisoned| *poisoned.into_inner())
    }
}

/// Generator of transaction identifiers
pub trait IdSource: Send + Sync {
    fn next_transaction_id(&self) -> TransactionId;
}

/// Random v4 UUIDs
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIds;

impl IdSource for UuidIds {
    fn next_transaction_id(&self) -> TransactionId {
        uuid::Uuid::new_v4().to_string()
    }
}

/// `tx-1`, `tx-2`, ... for reproducible replays
#[derive(Debug, Default)]
pub struct SequentialIds {
    next: AtomicU64,
}

impl SequentialIds {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdSource for SequentialIds {
    fn next_transaction_id(&self) -> TransactionId {
        format!("tx-{}", self.next.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_admins() {
        let mut admins = StaticAdmins::new(["root"]);
        admins.grant("ops");

        assert!(admins.is_admin("root"));
        assert!(admins.is_admin("ops"));
        assert!(!admins.is_admin("bob"));
    }

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);

        let now = clock.advance(Duration::hours(25)).unwrap();

        assert_eq!(now, clock.now());
        assert_eq!(clock.now() - start, Duration::hours(25));
    }

    #[test]
    fn test_manual_clock_rejects_overflow() {
        let start = Utc::now();
        let clock = ManualClock::new(start);

        let result = clock.advance(Duration::weeks(20_000_000));

        assert!(matches!(result, Err(EscrowError::InvalidArgument { .. })));
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn test_sequential_ids() {
        let ids = SequentialIds::new();

        assert_eq!(ids.next_transaction_id(), "tx-1");
        assert_eq!(ids.next_transaction_id(), "tx-2");
    }

    #[test]
    fn test_uuid_ids_are_unique() {
        let ids = UuidIds;
        assert_ne!(ids.next_transaction_id(), ids.next_transaction_id());
    }

    #[test]
    fn test_recording_notifier() {
        let notifier = RecordingNotifier::new();
        notifier.notify(TransactionEvent::Approved {
            transaction: "tx-1".to_string(),
            buyer: "bob".to_string(),
        });

        let events = notifier.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].transaction(), "tx-1");
    }
}
