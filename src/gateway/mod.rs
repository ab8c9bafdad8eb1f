//! Payment Gateway Adapter
//!
//! The sole integration point with the external payment processor. The
//! processor contract is captured by the [`PaymentProcessor`] trait; the
//! [`PaymentGateway`] wraps it with the orchestrator's rules:
//!
//! - every mutating call carries an idempotency key produced by
//!   [`idempotency_key`], derived from the owning transaction id, so a retry
//!   never duplicates an effect
//! - holds are authorization-only and only go to payment-ready sellers
//! - cancelling an already cancelled hold is a success
//!
//! The gateway never retries on its own. Callers retry with the same key.
//!
//! - [`memory`] - In-process processor used by tests and the replay tool

pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::types::{EscrowError, User};

pub use memory::MemoryProcessor;

/// Mutating processor operations, used to namespace idempotency keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayOperation {
    Create,
    Capture,
    Cancel,
    Refund,
}

impl GatewayOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayOperation::Create => "create",
            GatewayOperation::Capture => "capture",
            GatewayOperation::Cancel => "cancel",
            GatewayOperation::Refund => "refund",
        }
    }
}

impl fmt::Display for GatewayOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic idempotency key for `operation` on a transaction
///
/// Every adapter call site goes through this function, so the same logical
/// operation on the same transaction always presents the same key.
pub fn idempotency_key(operation: GatewayOperation, transaction_id: &str) -> String {
    format!("{}:{}", operation.as_str(), transaction_id)
}

/// Processor-side state of a payment intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    /// Authorized, funds held, waiting for capture
    RequiresCapture,
    /// Captured
    Succeeded,
    /// Authorization released
    Canceled,
    /// Captured and then reversed
    Refunded,
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::RequiresCapture => "requires_capture",
            IntentStatus::Succeeded => "succeeded",
            IntentStatus::Canceled => "canceled",
            IntentStatus::Refunded => "refunded",
        }
    }
}

/// Metadata embedded in every intent, read back by the webhook reconciler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentMetadata {
    pub transaction_id: String,
    /// User who initiated the hold (the buyer)
    pub user_id: String,
    pub item_id: String,
}

/// Parameters of an authorization-only payment intent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateIntentRequest {
    pub amount: i64,
    pub destination: String,
    pub application_fee: i64,
    pub metadata: IntentMetadata,
}

/// A payment intent as reported by the processor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub amount: i64,
    pub application_fee: i64,
    pub destination: String,
    pub status: IntentStatus,
    pub metadata: IntentMetadata,
}

/// Errors reported by the processor
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProcessorError {
    #[error("payment intent {0} not found")]
    NotFound(String),

    #[error("payment intent {intent} is {}", status.as_str())]
    InvalidState {
        intent: String,
        status: IntentStatus,
    },

    /// The request had no effect because it was already applied
    #[error("payment intent {0} is already canceled")]
    Redundant(String),

    #[error("processor unavailable: {0}")]
    Transient(String),
}

/// Contract of the external payment processor
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Create a manual-capture intent
    async fn create_intent(
        &self,
        request: CreateIntentRequest,
        idempotency_key: &str,
    ) -> Result<PaymentIntent, ProcessorError>;

    async fn retrieve_intent(&self, intent_id: &str) -> Result<PaymentIntent, ProcessorError>;

    async fn capture_intent(
        &self,
        intent_id: &str,
        idempotency_key: &str,
    ) -> Result<PaymentIntent, ProcessorError>;

    async fn cancel_intent(
        &self,
        intent_id: &str,
        idempotency_key: &str,
    ) -> Result<PaymentIntent, ProcessorError>;

    async fn refund_intent(
        &self,
        intent_id: &str,
        idempotency_key: &str,
    ) -> Result<PaymentIntent, ProcessorError>;
}

/// What [`PaymentGateway::release`] ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The hold was cancelled
    Cancelled,
    /// The payment had been captured and was refunded
    Refunded,
    /// Nothing left to release
    AlreadyReleased,
}

fn map_processor_error(operation: GatewayOperation, error: ProcessorError) -> EscrowError {
    match error {
        ProcessorError::NotFound(intent) => EscrowError::not_found("payment intent", &intent),
        ProcessorError::InvalidState { intent, status } => {
            EscrowError::gateway_invalid_state(&intent, status.as_str(), operation.as_str())
        }
        other => EscrowError::gateway(operation.as_str(), other.to_string()),
    }
}

/// Adapter between the orchestrator and the payment processor
#[derive(Clone)]
pub struct PaymentGateway {
    processor: Arc<dyn PaymentProcessor>,
}

impl fmt::Debug for PaymentGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaymentGateway").finish_non_exhaustive()
    }
}

impl PaymentGateway {
    pub fn new(processor: Arc<dyn PaymentProcessor>) -> Self {
        Self { processor }
    }

    /// Place an authorization hold for `amount`, destined to `seller`
    ///
    /// # Returns
    ///
    /// * `Ok(PaymentIntent)` - the (possibly pre-existing) intent for this transaction
    /// * `Err(EscrowError::PreconditionFailed)` - the seller cannot receive payments
    /// * `Err(EscrowError::Gateway)` - the processor failed; retry is safe
    pub async fn create_hold(
        &self,
        transaction_id: &str,
        amount: i64,
        seller: &User,
        fee_amount: i64,
        metadata: IntentMetadata,
    ) -> Result<PaymentIntent, EscrowError> {
        if amount <= 0 {
            return Err(EscrowError::invalid_argument(format!(
                "hold amount must be positive, got {}",
                amount
            )));
        }

        let destination = seller.payment_destination().ok_or_else(|| {
            EscrowError::precondition_failed(
                "create payment hold",
                format!("seller {} cannot receive payments yet", seller.id),
            )
        })?;

        let request = CreateIntentRequest {
            amount,
            destination: destination.to_string(),
            application_fee: fee_amount,
            metadata,
        };
        let key = idempotency_key(GatewayOperation::Create, transaction_id);

        let intent = self
            .processor
            .create_intent(request, &key)
            .await
            .map_err(|e| map_processor_error(GatewayOperation::Create, e))?;

        info!(
            transaction = transaction_id,
            intent = %intent.id,
            amount,
            fee = fee_amount,
            "payment hold created"
        );
        Ok(intent)
    }

    /// Capture a previously authorized hold
    ///
    /// An intent that is already `succeeded` is returned as is.
    pub async fn capture(
        &self,
        transaction_id: &str,
        intent_id: &str,
    ) -> Result<PaymentIntent, EscrowError> {
        let key = idempotency_key(GatewayOperation::Capture, transaction_id);

        match self.processor.capture_intent(intent_id, &key).await {
            Ok(intent) => {
                info!(transaction = transaction_id, intent = intent_id, "payment captured");
                Ok(intent)
            }
            Err(ProcessorError::InvalidState {
                status: IntentStatus::Succeeded,
                ..
            }) => {
                debug!(transaction = transaction_id, intent = intent_id, "payment already captured");
                self.retrieve(intent_id).await
            }
            Err(e) => Err(map_processor_error(GatewayOperation::Capture, e)),
        }
    }

    /// Release an authorization without capturing
    ///
    /// Already cancelled intents are treated as success.
    pub async fn cancel_hold(&self, transaction_id: &str, intent_id: &str) -> Result<(), EscrowError> {
        let key = idempotency_key(GatewayOperation::Cancel, transaction_id);

        match self.processor.cancel_intent(intent_id, &key).await {
            Ok(_) => {
                info!(transaction = transaction_id, intent = intent_id, "payment hold cancelled");
                Ok(())
            }
            Err(ProcessorError::Redundant(_))
            | Err(ProcessorError::InvalidState {
                status: IntentStatus::Canceled,
                ..
            }) => {
                debug!(transaction = transaction_id, intent = intent_id, "hold already cancelled");
                Ok(())
            }
            Err(e) => Err(map_processor_error(GatewayOperation::Cancel, e)),
        }
    }

    /// Reverse a captured payment
    pub async fn refund(&self, transaction_id: &str, intent_id: &str) -> Result<(), EscrowError> {
        let key = idempotency_key(GatewayOperation::Refund, transaction_id);

        self.processor
            .refund_intent(intent_id, &key)
            .await
            .map_err(|e| map_processor_error(GatewayOperation::Refund, e))?;

        info!(transaction = transaction_id, intent = intent_id, "payment refunded");
        Ok(())
    }

    /// Cancel the hold if still authorized, refund it if already captured
    ///
    /// A capture that lands between the status read and the cancel is
    /// refunded instead.
    pub async fn release(
        &self,
        transaction_id: &str,
        intent_id: &str,
    ) -> Result<ReleaseOutcome, EscrowError> {
        let intent = self
            .processor
            .retrieve_intent(intent_id)
            .await
            .map_err(|e| map_processor_error(GatewayOperation::Cancel, e))?;

        match intent.status {
            IntentStatus::RequiresCapture => match self.cancel_hold(transaction_id, intent_id).await {
                Ok(()) => Ok(ReleaseOutcome::Cancelled),
                Err(EscrowError::GatewayInvalidState { status, .. })
                    if status == IntentStatus::Succeeded.as_str() =>
                {
                    debug!(transaction = transaction_id, intent = intent_id, "hold captured while releasing");
                    self.refund(transaction_id, intent_id).await?;
                    Ok(ReleaseOutcome::Refunded)
                }
                Err(e) => Err(e),
            },
            IntentStatus::Succeeded => {
                self.refund(transaction_id, intent_id).await?;
                Ok(ReleaseOutcome::Refunded)
            }
            IntentStatus::Canceled | IntentStatus::Refunded => Ok(ReleaseOutcome::AlreadyReleased),
        }
    }

    pub async fn retrieve(&self, intent_id: &str) -> Result<PaymentIntent, EscrowError> {
        self.processor
            .retrieve_intent(intent_id)
            .await
            .map_err(|e| map_processor_error(GatewayOperation::Capture, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrivateContact;
    use rstest::rstest;

    fn seller(ready: bool) -> User {
        let mut user = User::new(
            "alice",
            PrivateContact {
                student_id: "S1".to_string(),
                email: "alice@campus.edu".to_string(),
            },
        );
        if ready {
            user.payout_account = Some("acct_alice".to_string());
            user.charges_enabled = true;
        }
        user
    }

    fn metadata() -> IntentMetadata {
        IntentMetadata {
            transaction_id: "tx-1".to_string(),
            user_id: "bob".to_string(),
            item_id: "book-1".to_string(),
        }
    }

    fn gateway() -> (Arc<MemoryProcessor>, PaymentGateway) {
        let processor = Arc::new(MemoryProcessor::new());
        let gateway = PaymentGateway::new(processor.clone());
        (processor, gateway)
    }

    #[rstest]
    #[case(GatewayOperation::Create, "tx-1", "create:tx-1")]
    #[case(GatewayOperation::Capture, "tx-1", "capture:tx-1")]
    #[case(GatewayOperation::Cancel, "abc", "cancel:abc")]
    #[case(GatewayOperation::Refund, "abc", "refund:abc")]
    fn test_idempotency_key(
        #[case] operation: GatewayOperation,
        #[case] tx: &str,
        #[case] expected: &str,
    ) {
        assert_eq!(idempotency_key(operation, tx), expected);
    }

    #[tokio::test]
    async fn test_create_hold_is_idempotent() {
        let (processor, gateway) = gateway();
        let seller = seller(true);

        let first = gateway
            .create_hold("tx-1", 1000, &seller, 100, metadata())
            .await
            .unwrap();
        let second = gateway
            .create_hold("tx-1", 1000, &seller, 100, metadata())
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(processor.intent_count(), 1);
        assert_eq!(first.status, IntentStatus::RequiresCapture);
        assert_eq!(first.application_fee, 100);
    }

    #[tokio::test]
    async fn test_create_hold_requires_payment_ready_seller() {
        let (processor, gateway) = gateway();

        let result = gateway
            .create_hold("tx-1", 1000, &seller(false), 100, metadata())
            .await;

        assert!(matches!(result, Err(EscrowError::PreconditionFailed { .. })));
        assert_eq!(processor.intent_count(), 0);
    }

    #[tokio::test]
    async fn test_capture_requires_capturable_intent() {
        let (_processor, gateway) = gateway();
        let intent = gateway
            .create_hold("tx-1", 1000, &seller(true), 100, metadata())
            .await
            .unwrap();

        gateway.cancel_hold("tx-1", &intent.id).await.unwrap();
        let result = gateway.capture("tx-1", &intent.id).await;

        assert!(matches!(result, Err(EscrowError::GatewayInvalidState { .. })));
    }

    #[tokio::test]
    async fn test_capture_of_captured_intent_succeeds() {
        let (processor, gateway) = gateway();
        let intent = gateway
            .create_hold("tx-1", 1000, &seller(true), 100, metadata())
            .await
            .unwrap();
        processor.set_status(&intent.id, IntentStatus::Succeeded);

        let captured = gateway.capture("tx-1", &intent.id).await.unwrap();
        assert_eq!(captured.status, IntentStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_cancel_hold_twice_is_success() {
        let (processor, gateway) = gateway();
        let intent = gateway
            .create_hold("tx-1", 1000, &seller(true), 100, metadata())
            .await
            .unwrap();

        gateway.cancel_hold("tx-1", &intent.id).await.unwrap();
        gateway.cancel_hold("tx-1", &intent.id).await.unwrap();

        assert_eq!(processor.status_of(&intent.id), Some(IntentStatus::Canceled));
    }

    #[tokio::test]
    async fn test_release_cancels_or_refunds() {
        let (processor, gateway) = gateway();
        let seller = seller(true);

        let held = gateway
            .create_hold("tx-1", 1000, &seller, 100, metadata())
            .await
            .unwrap();
        assert_eq!(
            gateway.release("tx-1", &held.id).await.unwrap(),
            ReleaseOutcome::Cancelled
        );

        let captured = gateway
            .create_hold("tx-2", 1000, &seller, 100, metadata())
            .await
            .unwrap();
        gateway.capture("tx-2", &captured.id).await.unwrap();
        assert_eq!(
            gateway.release("tx-2", &captured.id).await.unwrap(),
            ReleaseOutcome::Refunded
        );
        assert_eq!(processor.status_of(&captured.id), Some(IntentStatus::Refunded));

        assert_eq!(
            gateway.release("tx-2", &captured.id).await.unwrap(),
            ReleaseOutcome::AlreadyReleased
        );
    }

    /// Reports the intent as it was, then lets a capture land before the next call
    struct CapturedAfterRetrieve {
        inner: Arc<MemoryProcessor>,
    }

    #[async_trait]
    impl PaymentProcessor for CapturedAfterRetrieve {
        async fn create_intent(
            &self,
            request: CreateIntentRequest,
            idempotency_key: &str,
        ) -> Result<PaymentIntent, ProcessorError> {
            self.inner.create_intent(request, idempotency_key).await
        }

        async fn retrieve_intent(&self, intent_id: &str) -> Result<PaymentIntent, ProcessorError> {
            let intent = self.inner.retrieve_intent(intent_id).await?;
            self.inner.set_status(intent_id, IntentStatus::Succeeded);
            Ok(intent)
        }

        async fn capture_intent(
            &self,
            intent_id: &str,
            idempotency_key: &str,
        ) -> Result<PaymentIntent, ProcessorError> {
            self.inner.capture_intent(intent_id, idempotency_key).await
        }

        async fn cancel_intent(
            &self,
            intent_id: &str,
            idempotency_key: &str,
        ) -> Result<PaymentIntent, ProcessorError> {
            self.inner.cancel_intent(intent_id, idempotency_key).await
        }

        async fn refund_intent(
            &self,
            intent_id: &str,
            idempotency_key: &str,
        ) -> Result<PaymentIntent, ProcessorError> {
            self.inner.refund_intent(intent_id, idempotency_key).await
        }
    }

    #[tokio::test]
    async fn test_release_refunds_hold_captured_mid_release() {
        let inner = Arc::new(MemoryProcessor::new());
        let held = PaymentGateway::new(inner.clone())
            .create_hold("tx-1", 1000, &seller(true), 100, metadata())
            .await
            .unwrap();
        let gateway = PaymentGateway::new(Arc::new(CapturedAfterRetrieve {
            inner: inner.clone(),
        }));

        let outcome = gateway.release("tx-1", &held.id).await.unwrap();

        assert_eq!(outcome, ReleaseOutcome::Refunded);
        assert_eq!(inner.status_of(&held.id), Some(IntentStatus::Refunded));
    }

    #[tokio::test]
    async fn test_transient_failure_surfaces_as_gateway_error() {
        let (processor, gateway) = gateway();
        processor.fail_next(GatewayOperation::Create);

        let result = gateway
            .create_hold("tx-1", 1000, &seller(true), 100, metadata())
            .await;
        assert!(matches!(result, Err(EscrowError::Gateway { .. })));

        // Retry with the same key succeeds and creates exactly one intent
        gateway
            .create_hold("tx-1", 1000, &seller(true), 100, metadata())
            .await
            .unwrap();
        assert_eq!(processor.intent_count(), 1);
    }
}
