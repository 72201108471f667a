#![forbid(unsafe_code)]

use poem::Request;
use poem_openapi::{param::Query, payload::Json, ApiResponse, Object, OpenApi};
use anyhow::Result;
use std::sync::Arc;

use crate::utils::authz;
use crate::utils::config::RuntimeCtx;
use crate::utils::engine::{self, ListSeatsRequest};
use crate::utils::errors::{EngineError, HttpResult};
use crate::utils::sbs_utils::{self, RequestDebug};
use log::error;

// ***************************************************************************
//                          Request/Response Definitions
// ***************************************************************************
pub struct ListSeatsApi {
    pub ctx: Arc<RuntimeCtx>,
}

#[derive(Object)]
struct ReqListSeats {
    entity_id: String,
    min_price: Option<i64>,
    max_price: Option<i64>,
}

#[derive(Object, Debug)]
pub struct RespListSeats {
    result_code: String,
    result_msg: String,
    count: i64,
    entity_id: String,
    seats: Vec<SeatListElement>,
}

#[derive(Object, Debug)]
pub struct SeatListElement {
    seat_id: String,
    seat_number: i64,
    price: i64,
    entity_id: String,
    metadata: String,
}

// Implement the debug record trait for logging.
impl RequestDebug for ReqListSeats {
    type Req = ReqListSeats;
    fn get_request_info(&self) -> String {
        let mut s = String::with_capacity(255);
        s.push_str("  Request query:");
        s.push_str("\n    entity_id: ");
        s.push_str(&self.entity_id);
        s.push_str("\n    min_price: ");
        s.push_str(&self.min_price.map(|p| p.to_string()).unwrap_or_default());
        s.push_str("\n    max_price: ");
        s.push_str(&self.max_price.map(|p| p.to_string()).unwrap_or_default());
        s
    }
}

// ------------------- HTTP Status Codes -------------------
#[derive(Debug, ApiResponse)]
enum SbsResponse {
    #[oai(status = 200)]
    Http200(Json<RespListSeats>),
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

fn make_http_200(resp: RespListSeats) -> SbsResponse {
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
impl ListSeatsApi {
    #[oai(path = "/sbs/seats", method = "get")]
    async fn list_seats_api(
        &self,
        http_req: &Request,
        entity_id: Query<Option<String>>,
        min_price: Query<Option<i64>>,
        max_price: Query<Option<i64>>,
    ) -> SbsResponse {
        // Package the query parameters.
        let req = ReqListSeats {
            entity_id: entity_id.0.unwrap_or_default(),
            min_price: min_price.0,
            max_price: max_price.0,
        };

        match RespListSeats::process(&self.ctx, http_req, &req).await {
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
impl RespListSeats {
    fn new(entity_id: String, seats: Vec<SeatListElement>) -> Self {
        Self {
            result_code: "0".to_string(),
            result_msg: "success".to_string(),
            count: seats.len() as i64,
            entity_id,
            seats,
        }
    }

    async fn process(
        ctx: &RuntimeCtx,
        http_req: &Request,
        req: &ReqListSeats,
    ) -> Result<SbsResponse, anyhow::Error> {
        // Conditional logging depending on log level.
        sbs_utils::debug_request(http_req, req);

        // -------------------- Identity Gate ------------------------
        let rqctx = match authz::authenticate(ctx, http_req, None).await {
            Ok(c) => c,
            Err(e) => {
                error!("{}", e);
                return Ok(make_engine_error(&e));
            }
        };

        // -------------------- Engine -------------------------------
        let engine_req = ListSeatsRequest {
            entity_id: req.entity_id.clone(),
            min_price: req.min_price,
            max_price: req.max_price,
        };
        match engine::list_seats(ctx, &rqctx, &engine_req).await {
            Ok(seats) => {
                let elements = seats
                    .into_iter()
                    .map(|s| SeatListElement {
                        seat_id: s.seat_id,
                        seat_number: s.seat_number,
                        price: s.price,
                        entity_id: s.entity_id,
                        metadata: s.metadata,
                    })
                    .collect();
                Ok(make_http_200(Self::new(req.entity_id.clone(), elements)))
            }
            Err(e) => {
                error!("{}", e);
                Ok(make_engine_error(&e))
            }
        }
    }
}
