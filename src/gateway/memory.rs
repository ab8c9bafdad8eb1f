//! In-process payment processor
//!
//! `MemoryProcessor` models the subset of processor behaviour the
//! orchestrator relies on: manual-capture intents, idempotency keys that
//! replay the first response, and "redundant" responses for repeated
//! cancellations. Failures can be injected per operation for testing the
//! best-effort and fail-closed cleanup paths.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{
    CreateIntentRequest, GatewayOperation, IntentStatus, PaymentIntent, PaymentProcessor,
    ProcessorError,
};

/// Thread-safe in-memory payment processor
#[derive(Debug, Default)]
pub struct MemoryProcessor {
    intents: DashMap<String, PaymentIntent>,

    /// First successful response per idempotency key
    responses: DashMap<String, PaymentIntent>,

    /// Pending injected failures per operation
    failures: DashMap<GatewayOperation, u32>,

    next_id: AtomicU64,
}

impl MemoryProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `operation` fail with a transient error
    pub fn fail_next(&self, operation: GatewayOperation) {
        *self.failures.entry(operation).or_insert(0) += 1;
    }

    /// Number of distinct intents ever created
    pub fn intent_count(&self) -> usize {
        self.intents.len()
    }

    pub fn status_of(&self, intent_id: &str) -> Option<IntentStatus> {
        self.intents.get(intent_id).map(|intent| intent.status)
    }

    /// Overwrite an intent's status, as if changed outside the orchestrator
    pub fn set_status(&self, intent_id: &str, status: IntentStatus) -> bool {
        match self.intents.get_mut(intent_id) {
            Some(mut intent) => {
                intent.status = status;
                true
            }
            None => false,
        }
    }

    fn take_failure(&self, operation: GatewayOperation) -> Result<(), ProcessorError> {
        if let Some(mut pending) = self.failures.get_mut(&operation) {
            if *pending > 0 {
                *pending -= 1;
                return Err(ProcessorError::Transient(format!(
                    "injected {} failure",
                    operation
                )));
            }
        }
        Ok(())
    }

    /// Apply `transition` to an intent once per idempotency key
    fn mutate<F>(
        &self,
        operation: GatewayOperation,
        intent_id: &str,
        idempotency_key: &str,
        transition: F,
    ) -> Result<PaymentIntent, ProcessorError>
    where
        F: FnOnce(&mut PaymentIntent) -> Result<(), ProcessorError>,
    {
        self.take_failure(operation)?;

        match self.responses.entry(idempotency_key.to_string()) {
            Entry::Occupied(cached) => Ok(cached.get().clone()),
            Entry::Vacant(slot) => {
                let mut intent = self
                    .intents
                    .get_mut(intent_id)
                    .ok_or_else(|| ProcessorError::NotFound(intent_id.to_string()))?;
                transition(intent.value_mut())?;
                let snapshot = intent.clone();
                slot.insert(snapshot.clone());
                Ok(snapshot)
            }
        }
    }
}

#[async_trait]
impl PaymentProcessor for MemoryProcessor {
    async fn create_intent(
        &self,
        request: CreateIntentRequest,
        idempotency_key: &str,
    ) -> Result<PaymentIntent, ProcessorError> {
        self.take_failure(GatewayOperation::Create)?;

        match self.responses.entry(idempotency_key.to_string()) {
            Entry::Occupied(cached) => Ok(cached.get().clone()),
            Entry::Vacant(slot) => {
                let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                let intent = PaymentIntent {
                    id: format!("pi_{}", n),
                    amount: request.amount,
                    application_fee: request.application_fee,
                    destination: request.destination,
                    status: IntentStatus::RequiresCapture,
                    metadata: request.metadata,
                };
                self.intents.insert(intent.id.clone(), intent.clone());
                slot.insert(intent.clone());
                Ok(intent)
            }
        }
    }

    async fn retrieve_intent(&self, intent_id: &str) -> Result<PaymentIntent, ProcessorError> {
        self.intents
            .get(intent_id)
            .map(|intent| intent.clone())
            .ok_or_else(|| ProcessorError::NotFound(intent_id.to_string()))
    }

    async fn capture_intent(
        &self,
        intent_id: &str,
        idempotency_key: &str,
    ) -> Result<PaymentIntent, ProcessorError> {
        self.mutate(GatewayOperation::Capture, intent_id, idempotency_key, |intent| {
            match intent.status {
                IntentStatus::RequiresCapture => {
                    intent.status = IntentStatus::Succeeded;
                    Ok(())
                }
                status => Err(ProcessorError::InvalidState {
                    intent: intent.id.clone(),
                    status,
                }),
            }
        })
    }

    async fn cancel_intent(
        &self,
        intent_id: &str,
        idempotency_key: &str,
    ) -> Result<PaymentIntent, ProcessorError> {
        self.mutate(GatewayOperation::Cancel, intent_id, idempotency_key, |intent| {
            match intent.status {
                IntentStatus::RequiresCapture => {
                    intent.status = IntentStatus::Canceled;
                    Ok(())
                }
                IntentStatus::Canceled => Err(ProcessorError::Redundant(intent.id.clone())),
                status => Err(ProcessorError::InvalidState {
                    intent: intent.id.clone(),
                    status,
                }),
            }
        })
    }

    async fn refund_intent(
        &self,
        intent_id: &str,
        idempotency_key: &str,
    ) -> Result<PaymentIntent, ProcessorError> {
        self.mutate(GatewayOperation::Refund, intent_id, idempotency_key, |intent| {
            match intent.status {
                IntentStatus::Succeeded => {
                    intent.status = IntentStatus::Refunded;
                    Ok(())
                }
                status => Err(ProcessorError::InvalidState {
                    intent: intent.id.clone(),
                    status,
                }),
            }
        })
    }
}
