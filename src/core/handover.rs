//! Proof-of-handover tokens
//!
//! At the meetup the seller displays a short token bound to the transaction;
//! the buyer reads it and presents it to confirm receipt. The token is
//! `<transaction id>.<signature>`, both parts base64url without padding, with
//! the signature an HMAC-SHA256 over the transaction id. How it is rendered
//! (QR code, text) is up to the client.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::types::{EscrowError, TransactionId};

type HmacSha256 = Hmac<Sha256>;

/// Issues and verifies handover tokens
#[derive(Clone)]
pub struct HandoverTokens {
    secret: Vec<u8>,
}

impl std::fmt::Debug for HandoverTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandoverTokens").finish_non_exhaustive()
    }
}

impl HandoverTokens {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self) -> Result<HmacSha256, EscrowError> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| EscrowError::internal(format!("handover key rejected: {}", e)))
    }

    /// Token proving physical presence for `transaction_id`
    pub fn issue(&self, transaction_id: &str) -> Result<String, EscrowError> {
        let mut mac = self.mac()?;
        mac.update(transaction_id.as_bytes());
        let signature = mac.finalize().into_bytes();

        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(transaction_id.as_bytes()),
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }

    /// Transaction id carried by a genuine token
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the token is malformed or its signature does not
    /// match.
    pub fn verify(&self, token: &str) -> Result<TransactionId, EscrowError> {
        let invalid = || EscrowError::invalid_argument("invalid handover token");

        let (id_part, sig_part) = token.trim().split_once('.').ok_or_else(invalid)?;
        let id_bytes = URL_SAFE_NO_PAD.decode(id_part).map_err(|_| invalid())?;
        let signature = URL_SAFE_NO_PAD.decode(sig_part).map_err(|_| invalid())?;

        let mut mac = self.mac()?;
        mac.update(&id_bytes);
        mac.verify_slice(&signature).map_err(|_| invalid())?;

        String::from_utf8(id_bytes).map_err(|_| invalid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_issue_then_verify() {
        let tokens = HandoverTokens::new("secret");

        let token = tokens.issue("tx-42").unwrap();

        assert_eq!(tokens.verify(&token).unwrap(), "tx-42");
    }

    #[test]
    fn test_token_from_other_secret_rejected() {
        let token = HandoverTokens::new("other").issue("tx-42").unwrap();

        let result = HandoverTokens::new("secret").verify(&token);
        assert!(matches!(result, Err(EscrowError::InvalidArgument { .. })));
    }

    #[test]
    fn test_token_for_other_transaction_rejected() {
        let tokens = HandoverTokens::new("secret");
        let genuine = tokens.issue("tx-1").unwrap();
        let (_, signature) = genuine.split_once('.').unwrap();

        let forged = format!("{}.{}", URL_SAFE_NO_PAD.encode("tx-2"), signature);
        assert!(tokens.verify(&forged).is_err());
    }

    #[rstest]
    #[case::empty("")]
    #[case::no_separator("dHgtMQ")]
    #[case::bad_base64("!!!.???")]
    #[case::missing_signature("dHgtMQ.")]
    fn test_malformed_tokens_rejected(#[case] token: &str) {
        let tokens = HandoverTokens::new("secret");
        assert!(matches!(
            tokens.verify(token),
            Err(EscrowError::InvalidArgument { .. })
        ));
    }
}
