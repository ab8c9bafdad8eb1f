//! Webhook/Event Reconciler
//!
//! Receives "payment succeeded" events from the processor and applies the
//! same completion as the handover confirmation, keyed by the metadata
//! embedded in the intent. The two paths race; whichever loses gets
//! `AlreadyCompleted`.
//!
//! Payloads are trusted only after their signature checks out. The
//! signature header has the form `t=<unix seconds>,v1=<hex>` where the hex
//! part is HMAC-SHA256 over `"<t>.<raw body>"` with the shared webhook
//! secret.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, error, info, warn};

use crate::gateway::IntentMetadata;
use crate::types::{EscrowError, TransactionStatus};

use super::engine::{CompletionOutcome, TransactionEngine};

type HmacSha256 = Hmac<Sha256>;

/// Event type that triggers completion
pub const PAYMENT_SUCCEEDED: &str = "payment_intent.succeeded";

/// What the reconciler did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The event completed the transaction
    Completed,
    /// The transaction was already completed
    AlreadyCompleted,
    /// Acknowledged without effect (unrelated or uncorrelated event)
    Ignored,
    /// The transaction does not expect the event yet; redeliver later
    Retry,
}

impl WebhookOutcome {
    /// Status code to answer the processor with
    ///
    /// Anything but 2xx makes the processor redeliver.
    pub fn http_status(&self) -> u16 {
        match self {
            WebhookOutcome::Completed
            | WebhookOutcome::AlreadyCompleted
            | WebhookOutcome::Ignored => 200,
            WebhookOutcome::Retry => 409,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    data: EventData,
}

#[derive(Debug, Deserialize)]
struct EventData {
    object: EventObject,
}

#[derive(Debug, Deserialize)]
struct EventObject {
    id: String,
    #[serde(default)]
    metadata: Option<IntentMetadata>,
}

fn mac(secret: &str) -> Result<HmacSha256, EscrowError> {
    HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| EscrowError::internal(format!("webhook secret rejected: {}", e)))
}

/// Build the signature header for `payload` sent at `timestamp`
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> Result<String, EscrowError> {
    let mut mac = mac(secret)?;
    mac.update(format!("{}.", timestamp).as_bytes());
    mac.update(payload);
    let signature = hex::encode(mac.finalize().into_bytes());

    Ok(format!("t={},v1={}", timestamp, signature))
}

/// Check a signature header against `payload`
///
/// # Errors
///
/// `InvalidSignature` if the header is malformed, no `v1` signature matches,
/// or the timestamp is further than `tolerance_secs` from `now`.
pub fn verify_signature(
    secret: &str,
    header: &str,
    payload: &[u8],
    now: DateTime<Utc>,
    tolerance_secs: i64,
) -> Result<(), EscrowError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp =
        timestamp.ok_or_else(|| EscrowError::invalid_signature("missing or invalid timestamp"))?;
    if signatures.is_empty() {
        return Err(EscrowError::invalid_signature("no v1 signature"));
    }

    if (now.timestamp() - timestamp).abs() > tolerance_secs {
        return Err(EscrowError::invalid_signature(format!(
            "timestamp {} outside tolerance of {}s",
            timestamp, tolerance_secs
        )));
    }

    let matched = signatures.iter().any(|candidate| {
        let Ok(expected) = hex::decode(candidate) else {
            return false;
        };
        let Ok(mut mac) = mac(secret) else {
            return false;
        };
        mac.update(format!("{}.", timestamp).as_bytes());
        mac.update(payload);
        mac.verify_slice(&expected).is_ok()
    });

    if matched {
        Ok(())
    } else {
        Err(EscrowError::invalid_signature("signature mismatch"))
    }
}

#[derive(Debug, Clone)]
pub struct WebhookReconciler {
    engine: TransactionEngine,
}

impl WebhookReconciler {
    pub fn new(engine: TransactionEngine) -> Self {
        Self { engine }
    }

    /// Verify and apply one delivery
    ///
    /// # Returns
    ///
    /// * `Ok(WebhookOutcome)` - the event was authentic; answer with
    ///   [`WebhookOutcome::http_status`]
    /// * `Err(EscrowError::InvalidSignature)` - reject the delivery
    /// * `Err(EscrowError::InvalidArgument)` - the payload is not a valid event
    pub async fn handle(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<WebhookOutcome, EscrowError> {
        let ctx = self.engine.context();
        let tolerance = i64::try_from(ctx.config.webhook_tolerance.as_secs()).unwrap_or(i64::MAX);
        verify_signature(
            &ctx.config.webhook_secret,
            signature_header,
            payload,
            ctx.clock.now(),
            tolerance,
        )?;

        let event: WebhookEvent = serde_json::from_slice(payload)?;

        if event.kind != PAYMENT_SUCCEEDED {
            debug!(event = %event.id, kind = %event.kind, "ignoring webhook event");
            return Ok(WebhookOutcome::Ignored);
        }

        let intent_id = event.data.object.id.as_str();
        let Some(metadata) = event.data.object.metadata.as_ref() else {
            warn!(event = %event.id, intent = intent_id, "payment event without metadata");
            return Ok(WebhookOutcome::Ignored);
        };
        let transaction_id = metadata.transaction_id.as_str();

        let Some(current) = ctx.store.get_transaction(transaction_id).await? else {
            warn!(event = %event.id, transaction = transaction_id, "payment event for unknown transaction");
            return Ok(WebhookOutcome::Ignored);
        };
        let tx = &current.value;

        if tx.buyer_id != metadata.user_id {
            warn!(
                event = %event.id,
                transaction = transaction_id,
                user = %metadata.user_id,
                "payment event initiated by someone other than the buyer"
            );
            return Ok(WebhookOutcome::Ignored);
        }

        match (tx.status, tx.payment_intent_id.as_deref()) {
            (TransactionStatus::Cancelled, _) => {
                error!(
                    event = %event.id,
                    transaction = transaction_id,
                    intent = intent_id,
                    "payment succeeded for a cancelled transaction"
                );
                return Ok(WebhookOutcome::Ignored);
            }
            (_, Some(recorded)) if recorded != intent_id => {
                warn!(
                    event = %event.id,
                    transaction = transaction_id,
                    intent = intent_id,
                    recorded,
                    "payment event for a foreign intent"
                );
                return Ok(WebhookOutcome::Ignored);
            }
            _ => {}
        }

        match self.engine.complete(transaction_id, intent_id).await {
            Ok(CompletionOutcome::Completed(_)) => {
                info!(event = %event.id, transaction = transaction_id, "completed from webhook");
                Ok(WebhookOutcome::Completed)
            }
            Ok(CompletionOutcome::AlreadyCompleted(_)) => {
                debug!(event = %event.id, transaction = transaction_id, "already completed");
                Ok(WebhookOutcome::AlreadyCompleted)
            }
            Err(EscrowError::PreconditionFailed { reason, .. }) => {
                info!(
                    event = %event.id,
                    transaction = transaction_id,
                    %reason,
                    "transaction not ready for payment event, asking for redelivery"
                );
                Ok(WebhookOutcome::Retry)
            }
            Err(e) => Err(e),
        }
    }
}
