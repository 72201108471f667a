#![forbid(unsafe_code)]

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use log::error;

use crate::utils::config::{PaymentConfig, PaymentMode};
use crate::utils::errors::EngineError;

type HmacSha256 = Hmac<Sha256>;

// ***************************************************************************
//                          Constants and Types
// ***************************************************************************
// Reference formats accepted before any gateway round trip.
const ACCEPTED_REFERENCE_PREFIXES: [&str; 3] = ["PAY-", "pay_", "SIM-"];

// Gateway verification endpoint, relative to the configured gateway url.
const GATEWAY_VERIFY_PATH: &str = "/v1/payments";

// ---------------------------------------------------------------------------
// PaymentProof:
// ---------------------------------------------------------------------------
/// What the caller presents to prove a payment: either a bare gateway
/// reference or a signed gateway callback.
#[derive(Debug, Clone)]
pub enum PaymentProof {
    Reference { payment_id: String },
    SignedCallback { order_id: String, payment_id: String, signature: String },
}

// Gateway verify response body.
#[derive(Debug, Deserialize)]
struct GatewayVerifyResponse {
    status: String,
}

// ***************************************************************************
//                            Payment Verifier
// ***************************************************************************
/** Decides whether a payment reference is trustworthy for a reservation.
 * The verifier holds no state: consumption idempotency is enforced
 * downstream by the uniqueness of the reservation token on bookings.
 */
pub struct PaymentVerifier {
    mode: PaymentMode,
    shared_secret: String,
    gateway_url: String,
    http: reqwest::Client,
}

impl PaymentVerifier {
    pub fn new(config: &PaymentConfig) -> Self {
        Self {
            mode: config.mode,
            shared_secret: config.shared_secret.clone(),
            gateway_url: config.gateway_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    // -----------------------------------------------------------------------
    // verify:
    // -----------------------------------------------------------------------
    /** Validate the proof and return the payment reference to record on the
     * booking.  Every failure is a PaymentError; the caller keeps the seat
     * lock until TTL so the payment can be corrected and retried.
     */
    pub async fn verify(&self, proof: &PaymentProof) -> Result<String, EngineError> {
        match proof {
            PaymentProof::Reference { payment_id } => {
                check_reference_format(payment_id)?;
                match self.mode {
                    PaymentMode::Simulated => Ok(payment_id.clone()),
                    PaymentMode::Reference => {
                        self.verify_with_gateway(payment_id).await?;
                        Ok(payment_id.clone())
                    }
                    PaymentMode::SignedCallback => Err(EngineError::Payment(
                        "a signed gateway callback is required".to_string(),
                    )),
                }
            }
            PaymentProof::SignedCallback { order_id, payment_id, signature } => {
                self.verify_signature(order_id, payment_id, signature)?;
                Ok(payment_id.clone())
            }
        }
    }

    // -----------------------------------------------------------------------
    // verify_with_gateway:
    // -----------------------------------------------------------------------
    /** Ask the external gateway whether the reference is captured. */
    async fn verify_with_gateway(&self, payment_id: &str) -> Result<(), EngineError> {
        let url = format!("{}{}/{}/verify", self.gateway_url, GATEWAY_VERIFY_PATH, payment_id);
        let response = self.http.get(&url).send().await.map_err(|e| {
            error!("Payment gateway unreachable at {}: {}", url, e);
            EngineError::StoreUnavailable(format!("payment gateway: {}", e))
        })?;

        if !response.status().is_success() {
            return Err(EngineError::Payment(format!(
                "gateway rejected reference '{}' ({})",
                payment_id,
                response.status()
            )));
        }

        let body: GatewayVerifyResponse = response.json().await.map_err(|e| {
            EngineError::Payment(format!("unreadable gateway response: {}", e))
        })?;
        if body.status != "captured" {
            return Err(EngineError::Payment(format!(
                "reference '{}' is not captured (status={})",
                payment_id, body.status
            )));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // verify_signature:
    // -----------------------------------------------------------------------
    /** Recompute the keyed MAC over "orderId|paymentId" and compare against
     * the presented signature in constant time.
     */
    fn verify_signature(
        &self,
        order_id: &str,
        payment_id: &str,
        signature: &str,
    ) -> Result<(), EngineError> {
        let presented = hex::decode(signature)
            .map_err(|_| EngineError::Payment("malformed payment signature".to_string()))?;

        let mut mac = HmacSha256::new_from_slice(self.shared_secret.as_bytes())
            .map_err(|e| EngineError::Payment(format!("signature key setup: {}", e)))?;
        mac.update(order_id.as_bytes());
        mac.update(b"|");
        mac.update(payment_id.as_bytes());

        // Mac::verify_slice is the constant-time comparison.
        mac.verify_slice(&presented)
            .map_err(|_| EngineError::Payment("payment signature mismatch".to_string()))
    }
}

// ---------------------------------------------------------------------------
// check_reference_format:
// ---------------------------------------------------------------------------
fn check_reference_format(payment_id: &str) -> Result<(), EngineError> {
    if payment_id.len() > 4
        && ACCEPTED_REFERENCE_PREFIXES.iter().any(|p| payment_id.starts_with(p))
    {
        Ok(())
    } else {
        Err(EngineError::Payment(format!("malformed payment reference '{}'", payment_id)))
    }
}

// ---------------------------------------------------------------------------
// compute_signature:
// ---------------------------------------------------------------------------
/** The hex MAC a gateway callback carries.  Exposed for collaborators and
 * the test suites.
 */
#[allow(dead_code)]
pub fn compute_signature(shared_secret: &str, order_id: &str, payment_id: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(shared_secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(order_id.as_bytes());
    mac.update(b"|");
    mac.update(payment_id.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

// ***************************************************************************
//                                  Tests
// ***************************************************************************
#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::config::PaymentConfig;

    fn simulated() -> PaymentVerifier {
        PaymentVerifier::new(&PaymentConfig::default())
    }

    fn signed(secret: &str) -> PaymentVerifier {
        let config = PaymentConfig {
            mode: PaymentMode::SignedCallback,
            shared_secret: secret.to_string(),
            ..PaymentConfig::default()
        };
        PaymentVerifier::new(&config)
    }

    #[tokio::test]
    async fn simulated_accepts_known_prefixes() {
        let v = simulated();
        for id in ["PAY-OK-1", "pay_abc123", "SIM-99999"] {
            let reference = v
                .verify(&PaymentProof::Reference { payment_id: id.to_string() })
                .await
                .unwrap();
            assert_eq!(reference, id);
        }
    }

    #[tokio::test]
    async fn malformed_reference_is_a_payment_error() {
        let v = simulated();
        for id in ["", "PAY", "bogus-123", "ref_1"] {
            let err = v
                .verify(&PaymentProof::Reference { payment_id: id.to_string() })
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::Payment(_)), "id {:?}", id);
        }
    }

    #[tokio::test]
    async fn signed_callback_roundtrip() {
        let v = signed("gateway-secret");
        let signature = compute_signature("gateway-secret", "ORD-1", "PAY-77");
        let reference = v
            .verify(&PaymentProof::SignedCallback {
                order_id: "ORD-1".to_string(),
                payment_id: "PAY-77".to_string(),
                signature,
            })
            .await
            .unwrap();
        assert_eq!(reference, "PAY-77");
    }

    #[tokio::test]
    async fn tampered_signature_fails() {
        let v = signed("gateway-secret");
        let mut signature = compute_signature("gateway-secret", "ORD-1", "PAY-77");
        // Flip a hex nibble.
        let last = signature.pop().unwrap();
        signature.push(if last == '0' { '1' } else { '0' });
        let err = v
            .verify(&PaymentProof::SignedCallback {
                order_id: "ORD-1".to_string(),
                payment_id: "PAY-77".to_string(),
                signature,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Payment(_)));
    }

    #[tokio::test]
    async fn signature_binds_both_fields() {
        let v = signed("gateway-secret");
        let signature = compute_signature("gateway-secret", "ORD-1", "PAY-77");
        let err = v
            .verify(&PaymentProof::SignedCallback {
                order_id: "ORD-2".to_string(),
                payment_id: "PAY-77".to_string(),
                signature,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Payment(_)));
    }

    #[tokio::test]
    async fn non_hex_signature_is_rejected() {
        let v = signed("gateway-secret");
        let err = v
            .verify(&PaymentProof::SignedCallback {
                order_id: "ORD-1".to_string(),
                payment_id: "PAY-77".to_string(),
                signature: "zz-not-hex".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Payment(_)));
    }
}
