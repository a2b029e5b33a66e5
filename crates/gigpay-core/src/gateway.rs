use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::error::EscrowError;
use crate::types::{GatewayOrder, PaymentProof};

/// Pluggable payment-collection gateway.
///
/// Implementations talk to the external processor and hold no milestone or
/// wallet knowledge. `create_order` performs no local state change, so a
/// failed or timed-out call is always safe to retry.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create_order(
        &self,
        amount_minor: u64,
        currency: &str,
        receipt: &str,
        notes: BTreeMap<String, String>,
    ) -> Result<GatewayOrder, EscrowError>;

    /// Verify an out-of-band payment proof. Returns `false` on signature
    /// mismatch; errors are reserved for malformed input and transport
    /// failures.
    async fn verify_payment(&self, proof: &PaymentProof) -> Result<bool, EscrowError>;
}

/// Keyed signature scheme shared with the payment processor.
///
/// The processor signs `"{order_id}|{payment_id}"` with a shared secret;
/// verification recomputes the keyed hash and compares `blake3::Hash`
/// values, whose equality is constant-time, so a forged signature cannot
/// be confirmed byte-by-byte.
#[derive(Debug, Clone)]
pub struct PaymentSignature {
    key: [u8; 32],
}

const SIGNATURE_KEY_CONTEXT: &str = "gigpay payment proof v1";

impl PaymentSignature {
    pub fn new(secret: &str) -> Self {
        Self {
            key: blake3::derive_key(SIGNATURE_KEY_CONTEXT, secret.as_bytes()),
        }
    }

    pub fn sign(&self, order_id: &str, payment_id: &str) -> String {
        self.digest(order_id, payment_id).to_hex().to_string()
    }

    /// Check a presented signature. Malformed (non-hex, wrong length)
    /// signatures are a validation error; a well-formed but wrong signature
    /// is `Ok(false)`, never an error.
    pub fn verify(
        &self,
        order_id: &str,
        payment_id: &str,
        signature: &str,
    ) -> Result<bool, EscrowError> {
        let presented = blake3::Hash::from_hex(signature).map_err(|_| {
            EscrowError::Validation("payment signature is not a valid hex digest".to_string())
        })?;

        Ok(self.digest(order_id, payment_id) == presented)
    }

    fn digest(&self, order_id: &str, payment_id: &str) -> blake3::Hash {
        let material = format!("{order_id}|{payment_id}");
        blake3::keyed_hash(&self.key, material.as_bytes())
    }
}
