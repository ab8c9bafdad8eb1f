//! Explicitly constructed orchestrator context
//!
//! The process entry point builds one `EscrowContext` and hands an
//! `Arc<EscrowContext>` to every component that needs the store, the payment
//! gateway or one of the external collaborators. Nothing in the crate reaches
//! for global state.

use std::fmt;
use std::sync::Arc;

use crate::config::EscrowConfig;
use crate::gateway::{PaymentGateway, PaymentProcessor};
use crate::store::DocumentStore;

use super::traits::{
    AdminAuthorizer, Clock, IdSource, LogNotifier, Notifier, StaticAdmins, SystemClock, UuidIds,
};

/// Shared dependencies of every orchestrator component
pub struct EscrowContext {
    pub store: Arc<dyn DocumentStore>,
    pub gateway: PaymentGateway,
    pub notifier: Arc<dyn Notifier>,
    pub admins: Arc<dyn AdminAuthorizer>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdSource>,
    pub config: EscrowConfig,
}

impl fmt::Debug for EscrowContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EscrowContext")
            .field("gateway", &self.gateway)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EscrowContext {
    /// Create a context with default collaborators
    ///
    /// Defaults: log-only notifications, no administrators, the system clock
    /// and random transaction ids.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        processor: Arc<dyn PaymentProcessor>,
        config: EscrowConfig,
    ) -> Self {
        Self {
            store,
            gateway: PaymentGateway::new(processor),
            notifier: Arc::new(LogNotifier),
            admins: Arc::new(StaticAdmins::default()),
            clock: Arc::new(SystemClock),
            ids: Arc::new(UuidIds),
            config,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_admins(mut self, admins: Arc<dyn AdminAuthorizer>) -> Self {
        self.admins = admins;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_ids(mut self, ids: Arc<dyn IdSource>) -> Self {
        self.ids = ids;
        self
    }
}
