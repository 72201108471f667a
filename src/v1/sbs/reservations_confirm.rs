#![forbid(unsafe_code)]

use poem::Request;
use poem_openapi::{payload::Json, ApiResponse, Object, OpenApi};
use anyhow::Result;
use std::sync::Arc;

use crate::utils::authz::{self, ExternalUserFields};
use crate::utils::config::RuntimeCtx;
use crate::utils::engine::{self, ConfirmRequest};
use crate::utils::errors::{EngineError, HttpResult};
use crate::utils::payments::PaymentProof;
use crate::utils::sbs_utils::{self, RequestDebug};
use log::error;

// ***************************************************************************
//                          Request/Response Definitions
// ***************************************************************************
/** Confirm a reservation into a booking.  Requires the live lock, an ACTIVE
 * audit row and a verifiable payment: either a bare payment reference or a
 * signed gateway callback (order_id + payment_id + signature).
 */
pub struct ConfirmReservationApi {
    pub ctx: Arc<RuntimeCtx>,
}

#[derive(Object)]
pub struct ReqConfirmReservation {
    reservation_token: String,
    payment_id: Option<String>,
    order_id: Option<String>,
    signature: Option<String>,
    // Body-declared external user identity, honored after tenant auth.
    external_user_id: Option<String>,
    external_user_email: Option<String>,
    external_user_name: Option<String>,
}

#[derive(Object, Debug)]
pub struct RespConfirmReservation {
    result_code: String,
    result_msg: String,
    booking_id: String,
    booking: BookingObject,
    seat: SeatObject,
}

#[derive(Object, Debug)]
pub struct BookingObject {
    booking_id: String,
    seat_id: String,
    reservation_token: String,
    payment_status: String,
    payment_reference: String,
    amount: i64,
    currency: String,
    booking_date: String,
}

#[derive(Object, Debug)]
pub struct SeatObject {
    seat_id: String,
    seat_number: i64,
    price: i64,
    entity_id: String,
}

// Implement the debug record trait for logging.  Payment identifiers are
// caller-visible references, not secrets; signatures stay out of the log.
impl RequestDebug for ReqConfirmReservation {
    type Req = ReqConfirmReservation;
    fn get_request_info(&self) -> String {
        let mut s = String::with_capacity(255);
        s.push_str("  Request body:");
        s.push_str("\n    reservation_token: ");
        s.push_str(&self.reservation_token);
        s.push_str("\n    payment_id: ");
        s.push_str(self.payment_id.as_deref().unwrap_or(""));
        s.push_str("\n    order_id: ");
        s.push_str(self.order_id.as_deref().unwrap_or(""));
        s.push('\n');
        s
    }
}

// ------------------- HTTP Status Codes -------------------
#[derive(Debug, ApiResponse)]
enum SbsResponse {
    #[oai(status = 200)]
    Http200(Json<RespConfirmReservation>),
    #[oai(status = 400)]
    Http400(Json<HttpResult>),
    #[oai(status = 401)]
    Http401(Json<HttpResult>),
    #[oai(status = 402)]
    Http402(Json<HttpResult>),
    #[oai(status = 403)]
    Http403(Json<HttpResult>),
    #[oai(status = 404)]
    Http404(Json<HttpResult>),
    #[oai(status = 409)]
    Http409(Json<HttpResult>),
    #[oai(status = 423)]
    Http423(Json<HttpResult>),
    #[oai(status = 500)]
    Http500(Json<HttpResult>),
    #[oai(status = 503)]
    Http503(Json<HttpResult>),
}

fn make_http_200(resp: RespConfirmReservation) -> SbsResponse {
    SbsResponse::Http200(Json(resp))
}
fn make_http_400(msg: String) -> SbsResponse {
    SbsResponse::Http400(Json(HttpResult::new("VALIDATION_ERROR".to_string(), msg)))
}
fn make_http_500(msg: String) -> SbsResponse {
    SbsResponse::Http500(Json(HttpResult::new("INTERNAL_ERROR".to_string(), msg)))
}
fn make_engine_error(e: &EngineError) -> SbsResponse {
    let body = Json(HttpResult::from_engine_error(e));
    match e.http_status() {
        400 => SbsResponse::Http400(body),
        401 => SbsResponse::Http401(body),
        402 => SbsResponse::Http402(body),
        403 => SbsResponse::Http403(body),
        404 => SbsResponse::Http404(body),
        409 => SbsResponse::Http409(body),
        423 => SbsResponse::Http423(body),
        503 => SbsResponse::Http503(body),
        _ => SbsResponse::Http500(body),
    }
}

// ***************************************************************************
//                             OpenAPI Endpoint
// ***************************************************************************
#[OpenApi]
impl ConfirmReservationApi {
    #[oai(path = "/sbs/reservations/confirm", method = "post")]
    async fn confirm_reservation_api(
        &self,
        http_req: &Request,
        req: Json<ReqConfirmReservation>,
    ) -> SbsResponse {
        match RespConfirmReservation::process(&self.ctx, http_req, &req).await {
            Ok(r) => r,
            Err(e) => {
                // Assume a server fault if a raw error came through.
                let msg = "ERROR: ".to_owned() + e.to_string().as_str();
                error!("{}", msg);
                make_http_500(msg)
            }
        }
    }
}

// ***************************************************************************
//                          Request/Response Methods
// ***************************************************************************
impl RespConfirmReservation {
    fn new(outcome: engine::ConfirmOutcome) -> Self {
        let booking = outcome.booking;
        Self {
            result_code: "0".to_string(),
            result_msg: "success".to_string(),
            booking_id: booking.booking_id.clone(),
            booking: BookingObject {
                booking_id: booking.booking_id,
                seat_id: booking.seat_id,
                reservation_token: booking.reservation_token,
                payment_status: booking.payment_status,
                payment_reference: booking.payment_reference,
                amount: booking.amount,
                currency: booking.currency,
                booking_date: booking.booking_date,
            },
            seat: SeatObject {
                seat_id: outcome.seat.seat_id,
                seat_number: outcome.seat.seat_number,
                price: outcome.seat.price,
                entity_id: outcome.seat.entity_id,
            },
        }
    }

    async fn process(
        ctx: &RuntimeCtx,
        http_req: &Request,
        req: &ReqConfirmReservation,
    ) -> Result<SbsResponse, anyhow::Error> {
        // Conditional logging depending on log level.
        sbs_utils::debug_request(http_req, req);

        // -------------------- Build the Payment Proof --------------
        let proof = match build_proof(req) {
            Ok(p) => p,
            Err(msg) => {
                error!("{}", msg);
                return Ok(make_http_400(msg));
            }
        };

        // -------------------- Identity Gate ------------------------
        let body_user = ExternalUserFields {
            external_user_id: req.external_user_id.clone(),
            external_user_email: req.external_user_email.clone(),
            external_user_name: req.external_user_name.clone(),
        };
        let rqctx = match authz::authenticate(ctx, http_req, Some(&body_user)).await {
            Ok(c) => c,
            Err(e) => {
                error!("{}", e);
                return Ok(make_engine_error(&e));
            }
        };

        // -------------------- Engine -------------------------------
        let engine_req =
            ConfirmRequest { reservation_token: req.reservation_token.clone(), proof };
        match engine::confirm(ctx, &rqctx, &engine_req).await {
            Ok(outcome) => Ok(make_http_200(Self::new(outcome))),
            Err(e) => {
                error!("{}", e);
                Ok(make_engine_error(&e))
            }
        }
    }
}

// ***************************************************************************
//                          Private Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// build_proof:
// ---------------------------------------------------------------------------
/** A signed callback needs all three of order_id, payment_id and signature;
 * otherwise a bare payment_id is treated as a gateway reference.
 */
fn build_proof(req: &ReqConfirmReservation) -> Result<PaymentProof, String> {
    match (&req.order_id, &req.payment_id, &req.signature) {
        (Some(order_id), Some(payment_id), Some(signature)) => Ok(PaymentProof::SignedCallback {
            order_id: order_id.clone(),
            payment_id: payment_id.clone(),
            signature: signature.clone(),
        }),
        (None, Some(payment_id), None) => {
            Ok(PaymentProof::Reference { payment_id: payment_id.clone() })
        }
        _ => Err("confirm requires payment_id, or order_id + payment_id + signature".to_string()),
    }
}

// ***************************************************************************
//                                  Tests
// ***************************************************************************
#[cfg(test)]
mod tests {
    use super::*;

    fn req(
        payment_id: Option<&str>,
        order_id: Option<&str>,
        signature: Option<&str>,
    ) -> ReqConfirmReservation {
        ReqConfirmReservation {
            reservation_token: "tok".to_string(),
            payment_id: payment_id.map(String::from),
            order_id: order_id.map(String::from),
            signature: signature.map(String::from),
            external_user_id: None,
            external_user_email: None,
            external_user_name: None,
        }
    }

    #[test]
    fn bare_reference_builds_reference_proof() {
        match build_proof(&req(Some("PAY-1"), None, None)).unwrap() {
            PaymentProof::Reference { payment_id } => assert_eq!(payment_id, "PAY-1"),
            other => panic!("unexpected proof {:?}", other),
        }
    }

    #[test]
    fn full_triple_builds_signed_proof() {
        match build_proof(&req(Some("PAY-1"), Some("ORD-1"), Some("ab12"))).unwrap() {
            PaymentProof::SignedCallback { order_id, .. } => assert_eq!(order_id, "ORD-1"),
            other => panic!("unexpected proof {:?}", other),
        }
    }

    #[test]
    fn partial_inputs_are_rejected() {
        assert!(build_proof(&req(None, None, None)).is_err());
        assert!(build_proof(&req(None, Some("ORD-1"), None)).is_err());
        assert!(build_proof(&req(Some("PAY-1"), Some("ORD-1"), None)).is_err());
        assert!(build_proof(&req(Some("PAY-1"), None, Some("sig"))).is_err());
    }
}
