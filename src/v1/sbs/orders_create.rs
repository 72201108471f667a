#![forbid(unsafe_code)]

use poem::Request;
use poem_openapi::{payload::Json, ApiResponse, Object, OpenApi};
use anyhow::Result;
use std::sync::Arc;

use crate::utils::authz::{self, ExternalUserFields};
use crate::utils::config::RuntimeCtx;
use crate::utils::engine::{self, CreateOrderRequest};
use crate::utils::errors::{EngineError, HttpResult};
use crate::utils::sbs_utils::{self, RequestDebug};
use log::error;

// ***************************************************************************
//                          Request/Response Definitions
// ***************************************************************************
/** Create the gateway order for an active reservation, or return the order
 * already created for it.  Idempotent by reservation token, so frontends
 * can retry freely while the user is in the payment flow.
 */
pub struct CreateOrderApi {
    pub ctx: Arc<RuntimeCtx>,
}

#[derive(Object)]
pub struct ReqCreateOrder {
    reservation_token: String,
    amount: Option<i64>,
    currency: Option<String>,
    // Body-declared external user identity, honored after tenant auth.
    external_user_id: Option<String>,
    external_user_email: Option<String>,
    external_user_name: Option<String>,
}

#[derive(Object, Debug)]
pub struct RespCreateOrder {
    result_code: String,
    result_msg: String,
    order_id: String,
    reservation_token: String,
    amount: i64,
    currency: String,
    gateway_key: String,
}

// Implement the debug record trait for logging.
impl RequestDebug for ReqCreateOrder {
    type Req = ReqCreateOrder;
    fn get_request_info(&self) -> String {
        let mut s = String::with_capacity(255);
        s.push_str("  Request body:");
        s.push_str("\n    reservation_token: ");
        s.push_str(&self.reservation_token);
        s.push_str("\n    amount: ");
        s.push_str(&self.amount.map(|a| a.to_string()).unwrap_or_default());
        s.push_str("\n    currency: ");
        s.push_str(self.currency.as_deref().unwrap_or(""));
        s.push('\n');
        s
    }
}

// ------------------- HTTP Status Codes -------------------
#[derive(Debug, ApiResponse)]
enum SbsResponse {
    #[oai(status = 201)]
    Http201(Json<RespCreateOrder>),
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

fn make_http_201(resp: RespCreateOrder) -> SbsResponse {
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
        503 => SbsResponse::Http503(body),
        _ => SbsResponse::Http500(body),
    }
}

// ***************************************************************************
//                             OpenAPI Endpoint
// ***************************************************************************
#[OpenApi]
impl CreateOrderApi {
    #[oai(path = "/sbs/orders", method = "post")]
    async fn create_order_api(
        &self,
        http_req: &Request,
        req: Json<ReqCreateOrder>,
    ) -> SbsResponse {
        match RespCreateOrder::process(&self.ctx, http_req, &req).await {
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
impl RespCreateOrder {
    fn new(outcome: engine::OrderOutcome) -> Self {
        Self {
            result_code: "0".to_string(),
            result_msg: "success".to_string(),
            order_id: outcome.order_id,
            reservation_token: outcome.reservation_token,
            amount: outcome.amount,
            currency: outcome.currency,
            gateway_key: outcome.gateway_key,
        }
    }

    async fn process(
        ctx: &RuntimeCtx,
        http_req: &Request,
        req: &ReqCreateOrder,
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
        let engine_req = CreateOrderRequest {
            reservation_token: req.reservation_token.clone(),
            amount: req.amount,
            currency: req.currency.clone(),
        };
        match engine::create_order(ctx, &rqctx, &engine_req).await {
            Ok(outcome) => Ok(make_http_201(Self::new(outcome))),
            Err(e) => {
                error!("{}", e);
                Ok(make_engine_error(&e))
            }
        }
    }
}
