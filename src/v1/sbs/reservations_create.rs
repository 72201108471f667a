#![forbid(unsafe_code)]

use poem::Request;
use poem_openapi::{payload::Json, ApiResponse, Object, OpenApi};
use anyhow::Result;
use std::sync::Arc;

use crate::utils::authz::{self, ExternalUserFields};
use crate::utils::config::RuntimeCtx;
use crate::utils::engine::{self, ReserveRequest};
use crate::utils::errors::{EngineError, HttpResult};
use crate::utils::sbs_utils::{self, RequestDebug};
use log::error;

// ***************************************************************************
//                          Request/Response Definitions
// ***************************************************************************
/** Reserve a seat: take the TTL-bounded lock and write the ACTIVE audit
 * row.  The returned token is the handle for order creation, confirmation
 * and release; the seat stays invisible to other callers until the token
 * is confirmed, released or expires.
 */
pub struct ReserveSeatApi {
    pub ctx: Arc<RuntimeCtx>,
}

#[derive(Object)]
pub struct ReqReserveSeat {
    seat_id: String,
    // Body-declared external user identity, honored after tenant auth.
    external_user_id: Option<String>,
    external_user_email: Option<String>,
    external_user_name: Option<String>,
}

#[derive(Object, Debug)]
pub struct RespReserveSeat {
    result_code: String,
    result_msg: String,
    reservation_token: String,
    expires_at: String,
    ttl_seconds: u64,
    seat: SeatSnapshotObject,
}

#[derive(Object, Debug)]
pub struct SeatSnapshotObject {
    seat_id: String,
    seat_number: i64,
    price: i64,
    entity_id: String,
}

// Implement the debug record trait for logging.
impl RequestDebug for ReqReserveSeat {
    type Req = ReqReserveSeat;
    fn get_request_info(&self) -> String {
        let mut s = String::with_capacity(255);
        s.push_str("  Request body:");
        s.push_str("\n    seat_id: ");
        s.push_str(&self.seat_id);
        s.push_str("\n    external_user_id: ");
        s.push_str(self.external_user_id.as_deref().unwrap_or(""));
        s.push('\n');
        s
    }
}

// ------------------- HTTP Status Codes -------------------
#[derive(Debug, ApiResponse)]
enum SbsResponse {
    #[oai(status = 201)]
    Http201(Json<RespReserveSeat>),
    #[oai(status = 400)]
    Http400(Json<HttpResult>),
    #[oai(status = 401)]
    Http401(Json<HttpResult>),
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

fn make_http_201(resp: RespReserveSeat) -> SbsResponse {
    SbsResponse::Http201(Json(resp))
}
fn make_http_500(msg: String) -> SbsResponse {
    SbsResponse::Http500(Json(HttpResult::new("INTERNAL_ERROR".to_string(), msg)))
}
fn make_engine_error(e: &EngineError) -> SbsResponse {
    let body = Json(HttpResult::from_engine_error(e));
    match e.http_status() {
        400 => SbsResponse::Http400(body),
        401 => SbsResponse::Http401(body),
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
impl ReserveSeatApi {
    #[oai(path = "/sbs/reservations", method = "post")]
    async fn reserve_seat_api(
        &self,
        http_req: &Request,
        req: Json<ReqReserveSeat>,
    ) -> SbsResponse {
        match RespReserveSeat::process(&self.ctx, http_req, &req).await {
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
impl RespReserveSeat {
    fn new(outcome: engine::ReserveOutcome) -> Self {
        Self {
            result_code: "0".to_string(),
            result_msg: "success".to_string(),
            reservation_token: outcome.reservation_token,
            expires_at: outcome.expires_at,
            ttl_seconds: outcome.ttl_seconds,
            seat: SeatSnapshotObject {
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
        req: &ReqReserveSeat,
    ) -> Result<SbsResponse, anyhow::Error> {
        // Conditional logging depending on log level.
        sbs_utils::debug_request(http_req, req);

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
        let engine_req = ReserveRequest { seat_id: req.seat_id.clone() };
        match engine::reserve(ctx, &rqctx, &engine_req).await {
            Ok(outcome) => Ok(make_http_201(Self::new(outcome))),
            Err(e) => {
                error!("{}", e);
                Ok(make_engine_error(&e))
            }
        }
    }
}
