//! Transaction state machine
//!
//! This module provides the `TransactionEngine` that drives a transaction
//! through its lifecycle by coordinating the inventory lock, the payment
//! gateway, the rate limiter and the notifier.
//!
//! ```text
//! request_sent -> approved -> payment_pending -> completed
//!      |              |              |
//!      +--------------+--------------+--------> cancelled
//! ```
//!
//! The engine enforces business rules such as:
//! - Caller checks (only the seller approves, only the buyer pays and
//!   confirms the handover)
//! - Status guards read and written within one preconditioned commit, so
//!   every transition is idempotent under retry
//! - Terminal states (`completed`, `cancelled`) are never left
//! - Cancellation cleans up the payment first, failing closed or best-effort
//!   depending on [`CleanupMode`]

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::gateway::{IntentMetadata, ReleaseOutcome};
use crate::store::{
    require_item, require_transaction, require_user, run_optimistic, Document, Precondition,
    Versioned, WriteBatch,
};
use crate::types::{EscrowError, Transaction, TransactionStatus, UnlockedAssets, UserId};

use super::context::EscrowContext;
use super::fee::fee_with;
use super::handover::HandoverTokens;
use super::inventory::{stage_release, stage_sold, InventoryLock};
use super::rate_limiter::{RateLimiter, CREATE_PAYMENT_INTENT};
use super::traits::TransactionEvent;

/// How adapter failures are handled while cancelling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupMode {
    /// Log the failure and cancel anyway (scheduled cleanup)
    BestEffort,
    /// Abort and leave the transaction untouched (human-triggered)
    FailClosed,
}

/// Who asked for a cancellation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Canceller {
    Participant(UserId),
    Admin(UserId),
    Reaper,
}

impl fmt::Display for Canceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Canceller::Participant(user) => write!(f, "participant {}", user),
            Canceller::Admin(user) => write!(f, "admin {}", user),
            Canceller::Reaper => f.write_str("staleness reaper"),
        }
    }
}

/// Result of the completion path
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    /// This call completed the transaction
    Completed(Transaction),
    /// Someone else already did; nothing was written
    AlreadyCompleted(Transaction),
}

impl CompletionOutcome {
    pub fn transaction(&self) -> &Transaction {
        match self {
            CompletionOutcome::Completed(tx) | CompletionOutcome::AlreadyCompleted(tx) => tx,
        }
    }
}

/// Result of a cancellation
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// This call cancelled the transaction
    ///
    /// `release` is `None` when there was no payment to release or a
    /// best-effort release failed.
    Cancelled {
        transaction: Transaction,
        release: Option<ReleaseOutcome>,
    },
    /// The transaction was already cancelled
    AlreadyCancelled(Transaction),
}

impl CancelOutcome {
    pub fn transaction(&self) -> &Transaction {
        match self {
            CancelOutcome::Cancelled { transaction, .. } => transaction,
            CancelOutcome::AlreadyCancelled(tx) => tx,
        }
    }
}

/// Transaction lifecycle orchestrator
///
/// Every public operation takes the already-authenticated caller identity and
/// checks it against the transaction's participants before doing anything.
#[derive(Debug, Clone)]
pub struct TransactionEngine {
    ctx: Arc<EscrowContext>,
    inventory: InventoryLock,
    rate_limiter: RateLimiter,
    handover: HandoverTokens,
}

impl TransactionEngine {
    pub fn new(ctx: Arc<EscrowContext>) -> Self {
        TransactionEngine {
            inventory: InventoryLock::new(ctx.clone()),
            rate_limiter: RateLimiter::new(ctx.clone()),
            handover: HandoverTokens::new(&ctx.config.handover_secret),
            ctx,
        }
    }

    pub fn context(&self) -> &Arc<EscrowContext> {
        &self.ctx
    }

    fn attempts(&self) -> u32 {
        self.ctx.config.max_commit_attempts
    }

    /// Copy of `current` moved to `status`, stamped with the current time
    fn advance(&self, current: &Transaction, status: TransactionStatus) -> Transaction {
        let mut next = current.clone();
        next.status = status;
        next.updated_at = self.ctx.clock.now();
        next
    }

    /// Ask to buy `item_id`
    ///
    /// Reserves the item for `buyer_id` and creates a `request_sent`
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The item does not exist (`NotFound`)
    /// - The item is already reserved or sold (`Conflict`)
    /// - The buyer is the seller and self-trade is disabled (`PreconditionFailed`)
    pub async fn request_purchase(
        &self,
        item_id: &str,
        buyer_id: &str,
    ) -> Result<Transaction, EscrowError> {
        let item = require_item(self.ctx.store.as_ref(), item_id).await?;
        let tx = self
            .inventory
            .reserve(item_id, buyer_id, &item.value.seller_id)
            .await?;

        self.ctx.notifier.notify(TransactionEvent::RequestCreated {
            transaction: tx.id.clone(),
            seller: tx.seller_id.clone(),
        });
        Ok(tx)
    }

    /// Seller accepts the request (`request_sent -> approved`)
    ///
    /// Approving an already approved transaction returns it unchanged.
    pub async fn approve(
        &self,
        transaction_id: &str,
        caller: &str,
    ) -> Result<Transaction, EscrowError> {
        let (tx, changed) = run_optimistic("approve", self.attempts(), move || {
            self.try_approve(transaction_id, caller)
        })
        .await?;

        if changed {
            info!(transaction = transaction_id, seller = caller, "transaction approved");
            self.ctx.notifier.notify(TransactionEvent::Approved {
                transaction: tx.id.clone(),
                buyer: tx.buyer_id.clone(),
            });
        }
        Ok(tx)
    }

    async fn try_approve(
        &self,
        transaction_id: &str,
        caller: &str,
    ) -> Result<(Transaction, bool), EscrowError> {
        let current = require_transaction(self.ctx.store.as_ref(), transaction_id).await?;

        if current.value.seller_id != caller {
            return Err(EscrowError::permission_denied(caller, "approve"));
        }

        match current.value.status {
            TransactionStatus::Approved => return Ok((current.value, false)),
            TransactionStatus::RequestSent => {}
            other => {
                return Err(EscrowError::precondition_failed(
                    "approve",
                    format!("transaction {} is {}", transaction_id, other),
                ))
            }
        }

        let next = self.advance(&current.value, TransactionStatus::Approved);
        self.ctx
            .store
            .commit(WriteBatch::new().put(
                Document::Transaction(next.clone()),
                Precondition::Version(current.version),
            ))
            .await?;

        Ok((next, true))
    }

    /// Buyer authorizes payment (`approved -> payment_pending`)
    ///
    /// Places a hold for the item's current price with the platform fee and
    /// records the intent on the transaction. The hold's idempotency key is
    /// derived from the transaction id, so calling this again never creates a
    /// second intent; a transaction already in `payment_pending` is returned
    /// unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The caller is not the buyer (`PermissionDenied`)
    /// - The transaction is not `approved` (`PreconditionFailed`)
    /// - The buyer exceeded the payment-intent rate limit (`ResourceExhausted`)
    /// - The seller cannot receive payments (`PreconditionFailed`)
    /// - The processor failed (`Gateway`); nothing was written and retrying is safe
    pub async fn start_payment(
        &self,
        transaction_id: &str,
        caller: &str,
    ) -> Result<Transaction, EscrowError> {
        let store = self.ctx.store.as_ref();
        let tx = require_transaction(store, transaction_id).await?.value;

        if tx.buyer_id != caller {
            return Err(EscrowError::permission_denied(caller, "start payment"));
        }

        match tx.status {
            TransactionStatus::PaymentPending if tx.payment_intent_id.is_some() => return Ok(tx),
            TransactionStatus::Approved => {}
            other => {
                return Err(EscrowError::precondition_failed(
                    "start payment",
                    format!("transaction {} is {}", transaction_id, other),
                ))
            }
        }

        let config = &self.ctx.config;
        self.rate_limiter
            .check_and_record(
                caller,
                CREATE_PAYMENT_INTENT,
                config.payment_rate_limit,
                config.payment_rate_window,
            )
            .await?;

        let item = require_item(store, &tx.item_id).await?;
        let seller = require_user(store, &tx.seller_id).await?;
        let price = item.value.price;
        let fee = fee_with(price, config.fee_rate, config.min_fee);

        let metadata = IntentMetadata {
            transaction_id: tx.id.clone(),
            user_id: caller.to_string(),
            item_id: tx.item_id.clone(),
        };
        let intent = self
            .ctx
            .gateway
            .create_hold(&tx.id, price, &seller.value, fee, metadata)
            .await?;
        let intent_id = intent.id.as_str();

        let recorded = run_optimistic("start payment", self.attempts(), move || {
            self.try_record_intent(transaction_id, intent_id)
        })
        .await;

        match recorded {
            Ok((tx, true)) => {
                info!(
                    transaction = transaction_id,
                    intent = intent_id,
                    amount = price,
                    fee,
                    "payment authorized"
                );
                self.ctx.notifier.notify(TransactionEvent::PaymentAuthorized {
                    transaction: tx.id.clone(),
                    seller: tx.seller_id.clone(),
                });
                Ok(tx)
            }
            Ok((tx, false)) => Ok(tx),
            Err(e @ EscrowError::PreconditionFailed { .. }) => {
                // The transaction moved on while the hold was being placed
                warn!(transaction = transaction_id, intent = intent_id, "releasing orphaned hold");
                if let Err(cleanup) = self.ctx.gateway.cancel_hold(transaction_id, intent_id).await {
                    warn!(
                        transaction = transaction_id,
                        intent = intent_id,
                        error = %cleanup,
                        "failed to release orphaned hold"
                    );
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn try_record_intent(
        &self,
        transaction_id: &str,
        intent_id: &str,
    ) -> Result<(Transaction, bool), EscrowError> {
        let current = require_transaction(self.ctx.store.as_ref(), transaction_id).await?;

        match (current.value.status, current.value.payment_intent_id.as_deref()) {
            (TransactionStatus::PaymentPending, Some(existing)) if existing == intent_id => {
                return Ok((current.value, false))
            }
            (TransactionStatus::Approved, None) => {}
            (status, _) => {
                return Err(EscrowError::precondition_failed(
                    "start payment",
                    format!(
                        "transaction {} became {} while the hold was placed",
                        transaction_id, status
                    ),
                ))
            }
        }

        let mut next = self.advance(&current.value, TransactionStatus::PaymentPending);
        next.payment_intent_id = Some(intent_id.to_string());
        self.ctx
            .store
            .commit(WriteBatch::new().put(
                Document::Transaction(next.clone()),
                Precondition::Version(current.version),
            ))
            .await?;

        Ok((next, true))
    }

    /// Record where the parties will meet
    ///
    /// Either participant may set it while the transaction is open.
    pub async fn set_meeting_place(
        &self,
        transaction_id: &str,
        caller: &str,
        place: &str,
    ) -> Result<Transaction, EscrowError> {
        run_optimistic("set meeting place", self.attempts(), move || async move {
            let current = require_transaction(self.ctx.store.as_ref(), transaction_id).await?;

            if !current.value.is_participant(caller) {
                return Err(EscrowError::permission_denied(caller, "set meeting place"));
            }
            if current.value.status.is_terminal() {
                return Err(EscrowError::precondition_failed(
                    "set meeting place",
                    format!("transaction {} is {}", transaction_id, current.value.status),
                ));
            }

            let mut next = current.value.clone();
            next.meeting_place = Some(place.trim().to_string());
            next.updated_at = self.ctx.clock.now();
            self.ctx
                .store
                .commit(WriteBatch::new().put(
                    Document::Transaction(next.clone()),
                    Precondition::Version(current.version),
                ))
                .await?;
            Ok(next)
        })
        .await
    }

    /// Proof-of-handover token the seller shows at the meetup
    pub async fn handover_token(
        &self,
        transaction_id: &str,
        caller: &str,
    ) -> Result<String, EscrowError> {
        let tx = require_transaction(self.ctx.store.as_ref(), transaction_id)
            .await?
            .value;

        if tx.seller_id != caller {
            return Err(EscrowError::permission_denied(caller, "issue handover token"));
        }
        if tx.status != TransactionStatus::PaymentPending {
            return Err(EscrowError::precondition_failed(
                "issue handover token",
                format!("transaction {} is {}", transaction_id, tx.status),
            ));
        }

        self.handover.issue(&tx.id)
    }

    /// Buyer confirms receipt by presenting the seller's handover token
    ///
    /// Captures the hold, then completes the transaction. A capture failure
    /// aborts with the transaction untouched; retrying is safe because the
    /// capture is keyed by the transaction id.
    ///
    /// # Returns
    ///
    /// * `Ok(CompletionOutcome::Completed)` - the payment was captured and the
    ///   seller's contact details unlocked
    /// * `Ok(CompletionOutcome::AlreadyCompleted)` - nothing to do
    pub async fn confirm_handover(
        &self,
        token: &str,
        caller: &str,
    ) -> Result<CompletionOutcome, EscrowError> {
        let transaction_id = self.handover.verify(token)?;
        let tx = require_transaction(self.ctx.store.as_ref(), &transaction_id)
            .await?
            .value;

        if tx.buyer_id != caller {
            return Err(EscrowError::permission_denied(caller, "confirm handover"));
        }

        match tx.status {
            TransactionStatus::Completed => return Ok(CompletionOutcome::AlreadyCompleted(tx)),
            TransactionStatus::PaymentPending => {}
            other => {
                return Err(EscrowError::precondition_failed(
                    "confirm handover",
                    format!("transaction {} is {}", transaction_id, other),
                ))
            }
        }

        let intent_id = tx.payment_intent_id.as_deref().ok_or_else(|| {
            EscrowError::precondition_failed(
                "confirm handover",
                format!("transaction {} has no payment intent", transaction_id),
            )
        })?;

        self.ctx.gateway.capture(&tx.id, intent_id).await?;
        self.complete(&tx.id, intent_id).await
    }

    /// Apply the unlock (`payment_pending -> completed`) for a captured intent
    ///
    /// Shared by the handover confirmation and the webhook reconciler, which
    /// race to perform it. Whoever loses sees `AlreadyCompleted`.
    ///
    /// # Errors
    ///
    /// `PreconditionFailed` if the transaction is not `payment_pending` or
    /// `intent_id` is not its payment intent.
    pub async fn complete(
        &self,
        transaction_id: &str,
        intent_id: &str,
    ) -> Result<CompletionOutcome, EscrowError> {
        let outcome = run_optimistic("complete", self.attempts(), move || {
            self.try_complete(transaction_id, intent_id)
        })
        .await?;

        if let CompletionOutcome::Completed(tx) = &outcome {
            info!(
                transaction = transaction_id,
                intent = intent_id,
                fee = tx.fee_amount,
                "transaction completed, contact details unlocked"
            );
            self.ctx.notifier.notify(TransactionEvent::Completed {
                transaction: tx.id.clone(),
                buyer: tx.buyer_id.clone(),
                seller: tx.seller_id.clone(),
            });
        }
        Ok(outcome)
    }

    async fn try_complete(
        &self,
        transaction_id: &str,
        intent_id: &str,
    ) -> Result<CompletionOutcome, EscrowError> {
        let store = self.ctx.store.as_ref();
        let current = require_transaction(store, transaction_id).await?;

        match current.value.status {
            TransactionStatus::Completed => {
                return Ok(CompletionOutcome::AlreadyCompleted(current.value))
            }
            TransactionStatus::PaymentPending => {}
            other => {
                return Err(EscrowError::precondition_failed(
                    "complete",
                    format!("transaction {} is {}", transaction_id, other),
                ))
            }
        }

        if current.value.payment_intent_id.as_deref() != Some(intent_id) {
            return Err(EscrowError::precondition_failed(
                "complete",
                format!(
                    "intent {} does not belong to transaction {}",
                    intent_id, transaction_id
                ),
            ));
        }

        let item = require_item(store, &current.value.item_id).await?;
        let seller = require_user(store, &current.value.seller_id).await?;
        let config = &self.ctx.config;

        let mut next = self.advance(&current.value, TransactionStatus::Completed);
        next.fee_amount = Some(fee_with(item.value.price, config.fee_rate, config.min_fee));
        next.unlocked_assets = Some(UnlockedAssets {
            seller_student_id: seller.value.contact.student_id.clone(),
            seller_email: seller.value.contact.email.clone(),
            unlocked_at: next.updated_at,
        });

        let mut batch = WriteBatch::new().put(
            Document::Transaction(next.clone()),
            Precondition::Version(current.version),
        );
        if config.mark_item_sold_on_completion {
            batch = stage_sold(batch, &item);
        }
        store.commit(batch).await?;

        Ok(CompletionOutcome::Completed(next))
    }

    /// Buyer or seller withdraws from an open transaction
    ///
    /// Payment cleanup fails closed: if the hold cannot be released the
    /// transaction stays as it was.
    pub async fn cancel(
        &self,
        transaction_id: &str,
        caller: &str,
    ) -> Result<CancelOutcome, EscrowError> {
        let tx = require_transaction(self.ctx.store.as_ref(), transaction_id)
            .await?
            .value;

        if !tx.is_participant(caller) {
            return Err(EscrowError::permission_denied(caller, "cancel"));
        }

        self.cancel_with(
            transaction_id,
            Canceller::Participant(caller.to_string()),
            CleanupMode::FailClosed,
        )
        .await
    }

    /// Operator override: force an open transaction to `cancelled`
    pub async fn admin_cancel(
        &self,
        transaction_id: &str,
        operator: &str,
    ) -> Result<CancelOutcome, EscrowError> {
        if !self.ctx.admins.is_admin(operator) {
            return Err(EscrowError::permission_denied(operator, "admin cancel"));
        }

        self.cancel_with(
            transaction_id,
            Canceller::Admin(operator.to_string()),
            CleanupMode::FailClosed,
        )
        .await
    }

    /// Cancel a transaction, releasing its payment and its item
    ///
    /// The single cancellation routine behind participant, admin and reaper
    /// cancellations. The payment is released first (cancel if still
    /// authorized, refund if already captured); `mode` decides whether a
    /// failed release aborts the cancellation. The transaction and item are
    /// then written together.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The transaction is `completed` (`PreconditionFailed`)
    /// - The release failed in [`CleanupMode::FailClosed`]
    pub async fn cancel_with(
        &self,
        transaction_id: &str,
        canceller: Canceller,
        mode: CleanupMode,
    ) -> Result<CancelOutcome, EscrowError> {
        self.cancel_guarded(transaction_id, canceller, mode, None).await
    }

    /// Best-effort cancellation of a transaction found stale at `cutoff`
    ///
    /// Fails with `PreconditionFailed` if the transaction was updated at or
    /// after `cutoff` since it was selected.
    pub async fn cancel_stale(
        &self,
        transaction_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<CancelOutcome, EscrowError> {
        self.cancel_guarded(
            transaction_id,
            Canceller::Reaper,
            CleanupMode::BestEffort,
            Some(cutoff),
        )
        .await
    }

    async fn cancel_guarded(
        &self,
        transaction_id: &str,
        canceller: Canceller,
        mode: CleanupMode,
        stale_before: Option<DateTime<Utc>>,
    ) -> Result<CancelOutcome, EscrowError> {
        let outcome = run_optimistic("cancel", self.attempts(), move || {
            self.try_cancel(transaction_id, mode, stale_before)
        })
        .await?;

        if let CancelOutcome::Cancelled {
            transaction,
            release,
        } = &outcome
        {
            info!(
                transaction = transaction_id,
                by = %canceller,
                ?release,
                "transaction cancelled"
            );
            self.ctx.notifier.notify(TransactionEvent::Cancelled {
                transaction: transaction.id.clone(),
                buyer: transaction.buyer_id.clone(),
                seller: transaction.seller_id.clone(),
            });
        }
        Ok(outcome)
    }

    async fn try_cancel(
        &self,
        transaction_id: &str,
        mode: CleanupMode,
        stale_before: Option<DateTime<Utc>>,
    ) -> Result<CancelOutcome, EscrowError> {
        let store = self.ctx.store.as_ref();
        let current = require_transaction(store, transaction_id).await?;

        match current.value.status {
            TransactionStatus::Cancelled => {
                return Ok(CancelOutcome::AlreadyCancelled(current.value))
            }
            TransactionStatus::Completed => {
                return Err(EscrowError::precondition_failed(
                    "cancel",
                    format!("transaction {} is already completed", transaction_id),
                ))
            }
            _ => {}
        }

        if let Some(cutoff) = stale_before {
            if current.value.updated_at >= cutoff {
                return Err(EscrowError::precondition_failed(
                    "cancel stale",
                    format!("transaction {} was updated since it went stale", transaction_id),
                ));
            }
        }

        let release = match current.value.payment_intent_id.as_deref() {
            Some(intent_id) => self.release_payment(&current, intent_id, mode).await?,
            None => None,
        };

        let item = require_item(store, &current.value.item_id).await?;

        let mut next = self.advance(&current.value, TransactionStatus::Cancelled);
        next.cancelled_at = Some(next.updated_at);

        let batch = WriteBatch::new().put(
            Document::Transaction(next.clone()),
            Precondition::Version(current.version),
        );
        store.commit(stage_release(batch, &item)).await?;

        Ok(CancelOutcome::Cancelled {
            transaction: next,
            release,
        })
    }

    async fn release_payment(
        &self,
        current: &Versioned<Transaction>,
        intent_id: &str,
        mode: CleanupMode,
    ) -> Result<Option<ReleaseOutcome>, EscrowError> {
        let transaction_id = current.value.id.as_str();

        match self.ctx.gateway.release(transaction_id, intent_id).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) if mode == CleanupMode::BestEffort => {
                warn!(
                    transaction = transaction_id,
                    intent = intent_id,
                    error = %e,
                    "payment release failed, cancelling anyway"
                );
                Ok(None)
            }
            Err(e) => {
                error!(
                    transaction = transaction_id,
                    intent = intent_id,
                    error = %e,
                    "payment release failed, cancellation aborted"
                );
                Err(e)
            }
        }
    }
}
