#![forbid(unsafe_code)]

use poem::Request;
use poem_openapi::{param::Query, payload::Json, ApiResponse, Object, OpenApi};
use anyhow::Result;
use std::sync::Arc;

use crate::utils::authz;
use crate::utils::config::RuntimeCtx;
use crate::utils::engine::{self, BookingsPageRequest};
use crate::utils::errors::{EngineError, HttpResult};
use crate::utils::sbs_utils::{self, RequestDebug};
use log::error;

const DEFAULT_PAGE: i64 = 1;
const DEFAULT_LIMIT: i64 = 20;

// ***************************************************************************
//                          Request/Response Definitions
// ***************************************************************************
/** One page of the requesting user's bookings within the tenant, newest
 * first.
 */
pub struct ListBookingsApi {
    pub ctx: Arc<RuntimeCtx>,
}

#[derive(Object)]
struct ReqListBookings {
    page: i64,
    limit: i64,
}

#[derive(Object, Debug)]
pub struct RespListBookings {
    result_code: String,
    result_msg: String,
    count: i64,
    page: i64,
    limit: i64,
    bookings: Vec<BookingListElement>,
}

#[derive(Object, Debug)]
pub struct BookingListElement {
    booking_id: String,
    seat_id: String,
    reservation_token: String,
    payment_status: String,
    payment_reference: String,
    amount: i64,
    currency: String,
    booking_date: String,
}

// Implement the debug record trait for logging.
impl RequestDebug for ReqListBookings {
    type Req = ReqListBookings;
    fn get_request_info(&self) -> String {
        let mut s = String::with_capacity(255);
        s.push_str("  Request query:");
        s.push_str("\n    page: ");
        s.push_str(&self.page.to_string());
        s.push_str("\n    limit: ");
        s.push_str(&self.limit.to_string());
        s
    }
}

// ------------------- HTTP Status Codes -------------------
#[derive(Debug, ApiResponse)]
enum SbsResponse {
    #[oai(status = 200)]
    Http200(Json<RespListBookings>),
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

fn make_http_200(resp: RespListBookings) -> SbsResponse {
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
impl ListBookingsApi {
    #[oai(path = "/sbs/bookings", method = "get")]
    async fn list_bookings_api(
        &self,
        http_req: &Request,
        page: Query<Option<i64>>,
        limit: Query<Option<i64>>,
    ) -> SbsResponse {
        // Package the query parameters.
        let req = ReqListBookings {
            page: page.0.unwrap_or(DEFAULT_PAGE),
            limit: limit.0.unwrap_or(DEFAULT_LIMIT),
        };

        match RespListBookings::process(&self.ctx, http_req, &req).await {
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
impl RespListBookings {
    fn new(page: engine::BookingsPage) -> Self {
        let bookings = page
            .bookings
            .into_iter()
            .map(|b| BookingListElement {
                booking_id: b.booking_id,
                seat_id: b.seat_id,
                reservation_token: b.reservation_token,
                payment_status: b.payment_status,
                payment_reference: b.payment_reference,
                amount: b.amount,
                currency: b.currency,
                booking_date: b.booking_date,
            })
            .collect();
        Self {
            result_code: "0".to_string(),
            result_msg: "success".to_string(),
            count: page.total,
            page: page.page,
            limit: page.limit,
            bookings,
        }
    }

    async fn process(
        ctx: &RuntimeCtx,
        http_req: &Request,
        req: &ReqListBookings,
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
        let engine_req = BookingsPageRequest { page: req.page, limit: req.limit };
        match engine::my_bookings(ctx, &rqctx, &engine_req).await {
            Ok(page) => Ok(make_http_200(Self::new(page))),
            Err(e) => {
                error!("{}", e);
                Ok(make_engine_error(&e))
            }
        }
    }
}
