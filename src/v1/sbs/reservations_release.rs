#![forbid(unsafe_code)]

use poem::Request;
use poem_openapi::{payload::Json, ApiResponse, Object, OpenApi};
use anyhow::Result;
use std::sync::Arc;

use crate::utils::authz::{self, ExternalUserFields};
use crate::utils::config::RuntimeCtx;
use crate::utils::engine::{self, ReleaseRequest};
use crate::utils::errors::{EngineError, HttpResult};
use crate::utils::sbs_utils::{self, RequestDebug};
use log::error;

// ***************************************************************************
//                          Request/Response Definitions
// ***************************************************************************
/** Give a reserved seat back before payment.  Safe to repeat: releasing an
 * already-released (or lapsed) token acknowledges without changing state.
 */
pub struct ReleaseReservationApi {
    pub ctx: Arc<RuntimeCtx>,
}

#[derive(Object)]
pub struct ReqReleaseReservation {
    reservation_token: String,
    // Body-declared external user identity, honored after tenant auth.
    external_user_id: Option<String>,
    external_user_email: Option<String>,
    external_user_name: Option<String>,
}

#[derive(Object, Debug)]
pub struct RespReleaseReservation {
    result_code: String,
    result_msg: String,
    released: bool,
    status: String,
}

// Implement the debug record trait for logging.
impl RequestDebug for ReqReleaseReservation {
    type Req = ReqReleaseReservation;
    fn get_request_info(&self) -> String {
        let mut s = String::with_capacity(255);
        s.push_str("  Request body:");
        s.push_str("\n    reservation_token: ");
        s.push_str(&self.reservation_token);
        s.push('\n');
        s
    }
}

// ------------------- HTTP Status Codes -------------------
#[derive(Debug, ApiResponse)]
enum SbsResponse {
    #[oai(status = 200)]
    Http200(Json<RespReleaseReservation>),
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
    #[oai(status = 500)]
    Http500(Json<HttpResult>),
    #[oai(status = 503)]
    Http503(Json<HttpResult>),
}

fn make_http_200(resp: RespReleaseReservation) -> SbsResponse {
    SbsResponse::Http200(Json(resp))
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
        503 => SbsResponse::Http503(body),
        _ => SbsResponse::Http500(body),
    }
}

// ***************************************************************************
//                             OpenAPI Endpoint
// ***************************************************************************
#[OpenApi]
impl ReleaseReservationApi {
    #[oai(path = "/sbs/reservations/release", method = "post")]
    async fn release_reservation_api(
        &self,
        http_req: &Request,
        req: Json<ReqReleaseReservation>,
    ) -> SbsResponse {
        match RespReleaseReservation::process(&self.ctx, http_req, &req).await {
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
impl RespReleaseReservation {
    fn new(outcome: engine::ReleaseOutcome) -> Self {
        Self {
            result_code: "0".to_string(),
            result_msg: "success".to_string(),
            released: outcome.released,
            status: outcome.status,
        }
    }

    async fn process(
        ctx: &RuntimeCtx,
        http_req: &Request,
        req: &ReqReleaseReservation,
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
        let engine_req = ReleaseRequest { reservation_token: req.reservation_token.clone() };
        match engine::release(ctx, &rqctx, &engine_req).await {
            Ok(outcome) => Ok(make_http_200(Self::new(outcome))),
            Err(e) => {
                error!("{}", e);
                Ok(make_engine_error(&e))
            }
        }
    }
}
