//! Payment-gateway adapters for GigPay.

#![deny(unsafe_code)]

use async_trait::async_trait;
use chrono::Utc;
use gigpay_core::{EscrowError, GatewayOrder, PaymentGateway, PaymentProof, PaymentSignature};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Mock checkout gateway for deterministic local runs and tests.
///
/// Orders are created in-process and payment proofs are signed with the
/// gateway's own secret, so the full fund flow can be exercised without a
/// network.
#[derive(Debug, Clone)]
pub struct MockCheckoutGateway {
    signature: PaymentSignature,
}

impl MockCheckoutGateway {
    pub fn new(secret: &str) -> Self {
        Self {
            signature: PaymentSignature::new(secret),
        }
    }

    /// Produce the proof the real processor would hand back after the
    /// client completed the checkout for `order_id`.
    pub fn complete_payment(&self, order_id: &str) -> PaymentProof {
        let payment_id = format!("pay_{}", short_id());
        PaymentProof {
            signature: self.signature.sign(order_id, &payment_id),
            order_id: order_id.to_string(),
            payment_id,
        }
    }
}

#[async_trait]
impl PaymentGateway for MockCheckoutGateway {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_order(
        &self,
        amount_minor: u64,
        currency: &str,
        receipt: &str,
        notes: BTreeMap<String, String>,
    ) -> Result<GatewayOrder, EscrowError> {
        Ok(GatewayOrder {
            order_id: format!("order_{}", short_id()),
            amount_minor,
            currency: currency.to_string(),
            receipt: receipt.to_string(),
            notes,
            created_at: Utc::now(),
        })
    }

    async fn verify_payment(&self, proof: &PaymentProof) -> Result<bool, EscrowError> {
        self.signature
            .verify(&proof.order_id, &proof.payment_id, &proof.signature)
    }
}

/// HTTP-backed checkout gateway client.
///
/// `create_order` is the only network call and performs no local state
/// change, so transport failures and timeouts surface as retryable
/// `Gateway` errors. Payment proofs are verified locally against the
/// shared signing secret, never over the network.
pub struct HttpCheckoutGateway {
    client: reqwest::Client,
    base_url: String,
    key_id: String,
    key_secret: String,
    signature: PaymentSignature,
}

impl HttpCheckoutGateway {
    pub fn new(
        base_url: impl Into<String>,
        key_id: impl Into<String>,
        key_secret: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, EscrowError> {
        let key_secret = key_secret.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EscrowError::Gateway(format!("gateway client build failed: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            key_id: key_id.into(),
            signature: PaymentSignature::new(&key_secret),
            key_secret,
        })
    }
}

#[derive(Debug, Serialize)]
struct CreateOrderRequest<'a> {
    amount: u64,
    currency: &'a str,
    receipt: &'a str,
    notes: &'a BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct CreateOrderResponse {
    id: String,
    amount: u64,
    currency: String,
    receipt: Option<String>,
}

#[async_trait]
impl PaymentGateway for HttpCheckoutGateway {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn create_order(
        &self,
        amount_minor: u64,
        currency: &str,
        receipt: &str,
        notes: BTreeMap<String, String>,
    ) -> Result<GatewayOrder, EscrowError> {
        let url = format!("{}/v1/orders", self.base_url);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(&CreateOrderRequest {
                amount: amount_minor,
                currency,
                receipt,
                notes: &notes,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EscrowError::Gateway(format!("order creation timed out: {e}"))
                } else {
                    EscrowError::Gateway(format!("order creation failed: {e}"))
                }
            })?;

        if !response.status().is_success() {
            return Err(EscrowError::Gateway(format!(
                "processor rejected order creation: HTTP {}",
                response.status()
            )));
        }

        let body: CreateOrderResponse = response
            .json()
            .await
            .map_err(|e| EscrowError::Gateway(format!("order response decode failed: {e}")))?;

        Ok(GatewayOrder {
            order_id: body.id,
            amount_minor: body.amount,
            currency: body.currency,
            receipt: body.receipt.unwrap_or_else(|| receipt.to_string()),
            notes,
            created_at: Utc::now(),
        })
    }

    async fn verify_payment(&self, proof: &PaymentProof) -> Result<bool, EscrowError> {
        self.signature
            .verify(&proof.order_id, &proof.payment_id, &proof.signature)
    }
}

/// Deterministic failing gateway for chaos testing.
#[derive(Debug, Clone)]
pub struct AlwaysFailGateway {
    reason: String,
}

impl AlwaysFailGateway {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl PaymentGateway for AlwaysFailGateway {
    fn name(&self) -> &'static str {
        "always-fail"
    }

    async fn create_order(
        &self,
        _amount_minor: u64,
        _currency: &str,
        _receipt: &str,
        _notes: BTreeMap<String, String>,
    ) -> Result<GatewayOrder, EscrowError> {
        Err(EscrowError::Gateway(self.reason.clone()))
    }

    async fn verify_payment(&self, _proof: &PaymentProof) -> Result<bool, EscrowError> {
        Err(EscrowError::Gateway(self.reason.clone()))
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string().chars().take(12).collect()
}
