//! Scenario replay
//!
//! Drives a CSV scenario of marketplace actions through the orchestrator and
//! writes the resulting transaction ledger. The replay is fully in-process and
//! deterministic: documents live in a [`MemoryStore`], payments in a
//! [`MemoryProcessor`], time only moves on `advance` rows and transaction ids
//! are `tx-1`, `tx-2`, ... in creation order.
//!
//! # Error Handling
//!
//! Fatal errors (file not found, runtime or output failures) are returned.
//! A row that fails to parse or is rejected by the orchestrator is logged and
//! the replay continues with the next row.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::EscrowConfig;
use crate::core::{
    sign_payload, AdminAuthorizer, Clock, EscrowContext, ManualClock, RatingLedger, SequentialIds,
    StalenessReaper, TransactionEngine, WebhookOutcome, WebhookReconciler,
};
use crate::gateway::{IntentStatus, MemoryProcessor};
use crate::io::csv_format::{write_transactions_csv, LedgerRow, ScenarioAction};
use crate::io::sync_reader::SyncReader;
use crate::store::{require_transaction, DocumentStore, MemoryStore};
use crate::types::{EscrowError, Item, PrivateContact, User, UserId};

/// Start of replay time, 2024-09-01T00:00:00Z
const REPLAY_EPOCH_SECS: i64 = 1_725_148_800;

/// Condition recorded for listed items; scenarios do not grade items
const LISTED_CONDITION: u8 = 3;

/// Operator identities granted by `user` rows
///
/// Unlike [`crate::core::StaticAdmins`] it can grow after the context is built.
#[derive(Debug, Default)]
struct ScenarioAdmins {
    admins: DashSet<UserId>,
}

impl AdminAuthorizer for ScenarioAdmins {
    fn is_admin(&self, user: &str) -> bool {
        self.admins.contains(user)
    }
}

/// Replays scenario files against a fresh in-process marketplace
#[derive(Debug, Clone, Default)]
pub struct ScenarioReplay {
    config: EscrowConfig,
}

impl ScenarioReplay {
    pub fn new(config: EscrowConfig) -> Self {
        Self { config }
    }

    /// Replay `input_path` and write the final ledger to `output`
    ///
    /// Builds a multi-threaded tokio runtime sized by `sweep_concurrency` and
    /// blocks on [`ScenarioReplay::replay`].
    pub fn process(&self, input_path: &Path, output: &mut dyn Write) -> Result<(), EscrowError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.config.sweep_concurrency.max(1))
            .enable_all()
            .build()
            .map_err(|e| EscrowError::internal(format!("failed to create tokio runtime: {}", e)))?;

        runtime.block_on(self.replay(input_path, output))
    }

    /// Replay `input_path` on the current runtime
    pub async fn replay(&self, input_path: &Path, output: &mut dyn Write) -> Result<(), EscrowError> {
        let reader = SyncReader::new(input_path)?;
        let marketplace = Marketplace::new(self.config.clone());

        let mut applied = 0usize;
        let mut rejected = 0usize;
        for result in reader {
            let action = match result {
                Ok(action) => action,
                Err(e) => {
                    warn!(error = %e, "skipping malformed scenario row");
                    rejected += 1;
                    continue;
                }
            };

            match marketplace.apply(&action).await {
                Ok(()) => applied += 1,
                Err(e) => {
                    warn!(action = ?action, code = e.code().as_str(), error = %e, "scenario action rejected");
                    rejected += 1;
                }
            }
        }

        info!(applied, rejected, "scenario replay finished");

        let rows = marketplace.ledger().await?;
        write_transactions_csv(&rows, output)
    }
}

/// One replay's worth of orchestrator state
struct Marketplace {
    store: Arc<MemoryStore>,
    processor: Arc<MemoryProcessor>,
    clock: Arc<ManualClock>,
    admins: Arc<ScenarioAdmins>,
    engine: TransactionEngine,
    ratings: RatingLedger,
    reaper: StalenessReaper,
    webhooks: WebhookReconciler,
}

impl Marketplace {
    fn new(config: EscrowConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let processor = Arc::new(MemoryProcessor::new());
        let start = DateTime::<Utc>::from_timestamp(REPLAY_EPOCH_SECS, 0).unwrap_or_default();
        let clock = Arc::new(ManualClock::new(start));
        let admins = Arc::new(ScenarioAdmins::default());

        let ctx = Arc::new(
            EscrowContext::new(store.clone(), processor.clone(), config)
                .with_clock(clock.clone())
                .with_admins(admins.clone())
                .with_ids(Arc::new(SequentialIds::new())),
        );
        let engine = TransactionEngine::new(ctx.clone());

        Self {
            store,
            processor,
            clock,
            admins,
            ratings: RatingLedger::new(ctx),
            reaper: StalenessReaper::new(engine.clone()),
            webhooks: WebhookReconciler::new(engine.clone()),
            engine,
        }
    }

    async fn apply(&self, action: &ScenarioAction) -> Result<(), EscrowError> {
        match action {
            ScenarioAction::User { id, payable, admin } => {
                self.register(id, *payable, *admin);
            }
            ScenarioAction::List {
                seller,
                item,
                price,
            } => self.list(seller, item, *price).await?,
            ScenarioAction::Request { buyer, item } => {
                self.engine.request_purchase(item, buyer).await?;
            }
            ScenarioAction::Approve { seller, tx } => {
                self.engine.approve(tx, seller).await?;
            }
            ScenarioAction::Pay { buyer, tx } => {
                self.engine.start_payment(tx, buyer).await?;
            }
            ScenarioAction::Meet { user, tx, place } => {
                self.engine.set_meeting_place(tx, user, place).await?;
            }
            ScenarioAction::Handover { buyer, tx } => {
                let seller = require_transaction(self.store.as_ref(), tx)
                    .await?
                    .value
                    .seller_id;
                let token = self.engine.handover_token(tx, &seller).await?;
                self.engine.confirm_handover(&token, buyer).await?;
            }
            ScenarioAction::Webhook { tx } => self.deliver_payment_succeeded(tx).await?,
            ScenarioAction::Cancel { user, tx } => {
                self.engine.cancel(tx, user).await?;
            }
            ScenarioAction::AdminCancel { operator, tx } => {
                self.engine.admin_cancel(tx, operator).await?;
            }
            ScenarioAction::Rate {
                rater,
                tx,
                role,
                score,
            } => {
                self.ratings.rate(tx, rater, *role, *score).await?;
            }
            ScenarioAction::Advance { hours } => {
                let by = chrono::Duration::try_hours(*hours).ok_or_else(|| {
                    EscrowError::invalid_argument(format!("advance of {} hours is out of range", hours))
                })?;
                let now = self.clock.advance(by)?;
                debug!(hours, %now, "clock advanced");
            }
            ScenarioAction::Sweep => {
                self.reaper.sweep().await?;
            }
        }
        Ok(())
    }

    fn register(&self, id: &str, payable: bool, admin: bool) {
        let mut user = User::new(
            id,
            PrivateContact {
                student_id: format!("S-{}", id),
                email: format!("{}@campus.edu", id),
            },
        );
        if payable {
            user.payout_account = Some(format!("acct_{}", id));
            user.charges_enabled = true;
        }
        self.store.insert_user(user);

        if admin {
            self.admins.admins.insert(id.to_string());
        }
        debug!(user = id, payable, admin, "user registered");
    }

    async fn list(&self, seller: &str, item: &str, price: i64) -> Result<(), EscrowError> {
        if price <= 0 {
            return Err(EscrowError::invalid_argument(format!(
                "price of {} must be positive, got {}",
                item, price
            )));
        }
        if self.store.get_user(seller).await?.is_none() {
            return Err(EscrowError::not_found("user", seller));
        }
        if self.store.get_item(item).await?.is_some() {
            return Err(EscrowError::invalid_argument(format!(
                "item {} is already listed",
                item
            )));
        }

        self.store
            .insert_item(Item::new(item, item, price, seller, LISTED_CONDITION));
        debug!(item, seller, price, "item listed");
        Ok(())
    }

    /// Simulate the processor settling the hold and notifying us
    async fn deliver_payment_succeeded(&self, transaction_id: &str) -> Result<(), EscrowError> {
        let tx = require_transaction(self.store.as_ref(), transaction_id)
            .await?
            .value;
        let intent_id = tx.payment_intent_id.ok_or_else(|| {
            EscrowError::precondition_failed(
                "deliver webhook",
                format!("transaction {} has no payment intent", transaction_id),
            )
        })?;

        if self.processor.status_of(&intent_id) == Some(IntentStatus::RequiresCapture) {
            self.processor
                .set_status(&intent_id, IntentStatus::Succeeded);
        }

        let payload = json!({
            "id": format!("evt_{}", intent_id),
            "type": "payment_intent.succeeded",
            "data": {
                "object": {
                    "id": intent_id,
                    "metadata": {
                        "transaction_id": tx.id,
                        "user_id": tx.buyer_id,
                        "item_id": tx.item_id,
                    }
                }
            }
        })
        .to_string();

        let secret = &self.engine.context().config.webhook_secret;
        let header = sign_payload(secret, self.clock.now().timestamp(), payload.as_bytes())?;

        let outcome = self.webhooks.handle(payload.as_bytes(), &header).await?;
        if outcome == WebhookOutcome::Retry {
            warn!(
                transaction = transaction_id,
                status = outcome.http_status(),
                "webhook would be redelivered"
            );
        }
        Ok(())
    }

    async fn ledger(&self) -> Result<Vec<LedgerRow>, EscrowError> {
        let transactions = self.store.list_transactions().await?;
        let mut rows = Vec::with_capacity(transactions.len());

        for tx in transactions {
            let item_status = self
                .store
                .get_item(&tx.value.item_id)
                .await?
                .map(|item| item.value.status)
                .ok_or_else(|| EscrowError::not_found("item", &tx.value.item_id))?;
            rows.push(LedgerRow {
                transaction: tx.value,
                item_status,
            });
        }

        Ok(rows)
    }
}
