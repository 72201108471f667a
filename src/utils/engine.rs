#![forbid(unsafe_code)]

use std::sync::Arc;

use log::{error, info, warn};

use crate::utils::authz::RequestCtx;
use crate::utils::config::RuntimeCtx;
use crate::utils::db;
use crate::utils::db_types::{
    Booking, ReservationInput, Seat, RES_ACTIVE, RES_CONFIRMED, RES_EXPIRED, RES_RELEASED,
    SEAT_AVAILABLE,
};
use crate::utils::errors::EngineError;
use crate::utils::locks::{AcquireOutcome, LockStore};
use crate::utils::payments::PaymentProof;
use crate::utils::sbs_utils::{
    timestamp_str_to_datetime, timestamp_utc, timestamp_utc_to_str, with_deadline,
};
use uuid::Uuid;

// ***************************************************************************
//                         Operation Inputs/Outputs
// ***************************************************************************
#[derive(Debug)]
pub struct ListSeatsRequest {
    pub entity_id: String,
    pub min_price: Option<i64>,
    pub max_price: Option<i64>,
}

#[derive(Debug)]
pub struct ReserveRequest {
    pub seat_id: String,
}

#[derive(Debug)]
pub struct ConfirmRequest {
    pub reservation_token: String,
    pub proof: PaymentProof,
}

#[derive(Debug)]
pub struct ReleaseRequest {
    pub reservation_token: String,
}

#[derive(Debug)]
pub struct CreateOrderRequest {
    pub reservation_token: String,
    pub amount: Option<i64>,
    pub currency: Option<String>,
}

#[derive(Debug)]
pub struct BookingsPageRequest {
    pub page: i64,
    pub limit: i64,
}

/// The seat fields snapshotted into reservations and reserve responses.
#[derive(Debug, Clone)]
pub struct SeatSnapshot {
    pub seat_id: String,
    pub seat_number: i64,
    pub price: i64,
    pub entity_id: String,
}

impl SeatSnapshot {
    fn of(seat: &Seat) -> Self {
        Self {
            seat_id: seat.seat_id.clone(),
            seat_number: seat.seat_number,
            price: seat.price,
            entity_id: seat.entity_id.clone(),
        }
    }
}

#[derive(Debug)]
pub struct ReserveOutcome {
    pub reservation_token: String,
    pub expires_at: String,
    pub ttl_seconds: u64,
    pub seat: SeatSnapshot,
}

#[derive(Debug)]
pub struct ConfirmOutcome {
    pub booking: Booking,
    pub seat: SeatSnapshot,
}

#[derive(Debug)]
pub struct ReleaseOutcome {
    /// False when the call was an idempotent repeat with nothing to change.
    pub released: bool,
    pub status: String,
}

#[derive(Debug)]
pub struct OrderOutcome {
    pub order_id: String,
    pub reservation_token: String,
    pub amount: i64,
    pub currency: String,
    pub gateway_key: String,
}

#[derive(Debug)]
pub struct BookingsPage {
    pub bookings: Vec<Booking>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
}

// ***************************************************************************
//                           Engine Operations
// ***************************************************************************
// ---------------------------------------------------------------------------
// list_seats:
// ---------------------------------------------------------------------------
/** All AVAILABLE seats for the tenant/entity pair, minus any seat holding a
 * live lock.  The view is eventually consistent: a seat may be taken
 * between this read and a later reserve, which is the authoritative gate.
 */
pub async fn list_seats(
    ctx: &RuntimeCtx,
    rqctx: &RequestCtx,
    req: &ListSeatsRequest,
) -> Result<Vec<Seat>, EngineError> {
    if req.entity_id.is_empty() {
        return Err(EngineError::Validation("entity_id is required".to_string()));
    }
    if let (Some(min), Some(max)) = (req.min_price, req.max_price) {
        if min > max {
            return Err(EngineError::Validation("min_price exceeds max_price".to_string()));
        }
    }

    let seats = db::list_available_seats(
        &ctx.db,
        &rqctx.tenant.tenant_id,
        &req.entity_id,
        req.min_price,
        req.max_price,
    )
    .await?;

    // One round trip to drop seats currently held by somebody.
    let seat_ids: Vec<String> = seats.iter().map(|s| s.seat_id.clone()).collect();
    let locked = with_deadline(
        ctx.adapter_timeout_ms(),
        "lock store bulk_exists",
        ctx.locks.bulk_exists(&seat_ids),
    )
    .await?;

    Ok(seats
        .into_iter()
        .filter(|s| !locked.get(&s.seat_id).copied().unwrap_or(false))
        .collect())
}

// ---------------------------------------------------------------------------
// reserve:
// ---------------------------------------------------------------------------
/** Take the seat lock and write the ACTIVE audit row.  If the row cannot be
 * written, or this task is cancelled between the two steps, the lock is
 * released by token so the seat does not stay blocked until TTL expiry.
 */
pub async fn reserve(
    ctx: &RuntimeCtx,
    rqctx: &RequestCtx,
    req: &ReserveRequest,
) -> Result<ReserveOutcome, EngineError> {
    if req.seat_id.is_empty() {
        return Err(EngineError::Validation("seat_id is required".to_string()));
    }

    // -------- Load and screen the seat.
    let seat = db::get_seat(&ctx.db, &req.seat_id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("seat '{}' not found", req.seat_id)))?;
    if seat.tenant_id != rqctx.tenant.tenant_id {
        return Err(EngineError::conflict("seat belongs to another tenant"));
    }
    if seat.status != SEAT_AVAILABLE {
        return Err(EngineError::conflict("seat is not available"));
    }

    // -------- The atomic gate.
    let ttl = ctx.lock_ttl_seconds();
    let outcome = with_deadline(
        ctx.adapter_timeout_ms(),
        "lock store acquire",
        ctx.locks.acquire(&seat.seat_id, &rqctx.user.user_id, ttl),
    )
    .await?;
    let lock = match outcome {
        AcquireOutcome::Acquired(lock) => lock,
        AcquireOutcome::AlreadyHeld { expires_in } => {
            return Err(EngineError::SeatLock { expires_in });
        }
    };

    // From here until the audit row is committed the lock must not leak:
    // the guard compensates if this future is dropped mid-flight.
    let guard = LockGuard::new(ctx.locks.clone(), &seat.seat_id, &lock.token);

    // -------- Retire a lapsed predecessor.  A prior holder's lock can
    // vanish at TTL with its ACTIVE row never reconciled (no confirm on
    // that token, janitor off).  Holding the lock, retire any such row so
    // the one-ACTIVE-per-seat index admits ours.
    match db::expire_stale_seat_reservations(&ctx.db, &seat.seat_id).await {
        Ok(0) => (),
        Ok(n) => info!("Retired {} stale reservation(s) for seat '{}'.", n, seat.seat_id),
        Err(e) => {
            guard.release_now().await;
            return Err(e);
        }
    }

    // -------- The durable audit row.
    let now = timestamp_utc();
    let now_str = timestamp_utc_to_str(now);
    let expires_at = timestamp_utc_to_str(lock.expires_at);
    let rec = ReservationInput::new(
        lock.token.clone(),
        seat.tenant_id.clone(),
        rqctx.user.user_id.clone(),
        seat.seat_id.clone(),
        seat.entity_id.clone(),
        seat.seat_number,
        seat.price,
        expires_at.clone(),
        now_str.clone(),
        now_str,
    );

    if let Err(e) = db::insert_reservation(&ctx.db, rec).await {
        // Zombie-lock prevention: compare-and-delete before surfacing.
        guard.release_now().await;
        error!("Reservation insert failed for seat '{}': {}", seat.seat_id, e);
        return Err(e);
    }
    guard.disarm();

    info!(
        "Reservation '{}' created for user '{}' on seat '{}', expires at {}.",
        lock.token, rqctx.user.user_id, seat.seat_id, expires_at
    );

    Ok(ReserveOutcome {
        reservation_token: lock.token,
        expires_at,
        ttl_seconds: ttl,
        seat: SeatSnapshot::of(&seat),
    })
}

// ---------------------------------------------------------------------------
// confirm:
// ---------------------------------------------------------------------------
/** Turn an ACTIVE reservation into a booking.  The caller must hold the
 * live lock and present a verifiable payment; the durable transaction is
 * the serialization point for concurrent confirms and releases.
 */
pub async fn confirm(
    ctx: &RuntimeCtx,
    rqctx: &RequestCtx,
    req: &ConfirmRequest,
) -> Result<ConfirmOutcome, EngineError> {
    // -------- Step 1: the audit row.
    let res = db::get_reservation(&ctx.db, &req.reservation_token)
        .await?
        .ok_or_else(|| EngineError::NotFound("reservation not found".to_string()))?;
    if res.user_id != rqctx.user.user_id || res.tenant_id != rqctx.tenant.tenant_id {
        return Err(EngineError::conflict("reservation does not belong to requester"));
    }
    match res.status.as_str() {
        RES_ACTIVE => (),
        RES_CONFIRMED => {
            // The booking already exists; point the caller at it.
            let details = match db::get_booking_by_token(&ctx.db, &res.reservation_token).await? {
                Some(b) => format!("status={}; booking_id={}", RES_CONFIRMED, b.booking_id),
                None => format!("status={}", RES_CONFIRMED),
            };
            return Err(EngineError::Conflict(
                "reservation has already been confirmed".to_string(),
                Some(details),
            ));
        }
        other => {
            return Err(EngineError::Conflict(
                format!("reservation is not active (status={})", other),
                Some(format!("status={}", other)),
            ));
        }
    }

    let expires_at = timestamp_str_to_datetime(&res.expires_at)
        .map_err(|e| EngineError::StoreUnavailable(e.to_string()))?;
    if timestamp_utc() > expires_at {
        // Reconcile lazily: mark the audit row, drop any surviving lock.
        db::update_reservation_status(&ctx.db, &res.reservation_token, RES_ACTIVE, RES_EXPIRED)
            .await?;
        release_lock_quietly(&ctx.locks, &res.seat_id, &res.reservation_token).await;
        return Err(EngineError::Conflict(
            "reservation expired".to_string(),
            Some(format!("status={}", RES_EXPIRED)),
        ));
    }

    // -------- Step 2: the lock must still be ours.  The lock can be gone
    // while the audit row still says ACTIVE; the row alone proves nothing.
    let verified = with_deadline(
        ctx.adapter_timeout_ms(),
        "lock store verify",
        ctx.locks.verify(&res.seat_id, &res.reservation_token, &rqctx.user.user_id),
    )
    .await?;
    if !verified {
        let expires_in = match ctx.locks.inspect(&res.seat_id).await? {
            Some(lock) => lock.remaining_seconds(timestamp_utc()),
            None => 0,
        };
        return Err(EngineError::SeatLock { expires_in });
    }

    // -------- Step 3: the seat, re-read.
    let seat = db::get_seat(&ctx.db, &res.seat_id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("seat '{}' not found", res.seat_id)))?;
    if seat.status != SEAT_AVAILABLE {
        return Err(EngineError::conflict("seat is no longer available"));
    }

    // -------- Step 4: the payment.  On failure the lock is retained until
    // TTL so the caller can correct the payment and retry.
    let payment_reference = with_deadline(
        ctx.adapter_timeout_ms(),
        "payment verification",
        ctx.verifier.verify(&req.proof),
    )
    .await?;

    // -------- Steps 5-6: the transaction, then the lock.
    let currency = req_currency(ctx);
    let booking =
        db::run_confirm_transaction(&ctx.db, &res, &payment_reference, &currency).await?;

    // If the lock already expired the delete is a no-op.
    release_lock_quietly(&ctx.locks, &res.seat_id, &res.reservation_token).await;

    info!(
        "Booking '{}' created for user '{}' on seat '{}' (amount {} {}).",
        booking.booking_id, booking.user_id, booking.seat_id, booking.amount, booking.currency
    );

    Ok(ConfirmOutcome { booking, seat: SeatSnapshot::of(&seat) })
}

// ---------------------------------------------------------------------------
// release:
// ---------------------------------------------------------------------------
/** Give the seat back.  Idempotent on repeats: releasing a reservation that
 * already reached a terminal non-CONFIRMED state succeeds without mutation.
 */
pub async fn release(
    ctx: &RuntimeCtx,
    rqctx: &RequestCtx,
    req: &ReleaseRequest,
) -> Result<ReleaseOutcome, EngineError> {
    let res = db::get_reservation(&ctx.db, &req.reservation_token)
        .await?
        .ok_or_else(|| EngineError::NotFound("reservation not found".to_string()))?;
    if res.user_id != rqctx.user.user_id || res.tenant_id != rqctx.tenant.tenant_id {
        return Err(EngineError::conflict("reservation does not belong to requester"));
    }

    match res.status.as_str() {
        RES_CONFIRMED => Err(EngineError::Conflict(
            "reservation has already been confirmed".to_string(),
            Some(format!("status={}", RES_CONFIRMED)),
        )),
        RES_RELEASED | RES_EXPIRED => {
            Ok(ReleaseOutcome { released: false, status: res.status })
        }
        _ => {
            // The guarded transition is the decision point when a confirm
            // is racing this call.
            let won = db::update_reservation_status(
                &ctx.db,
                &res.reservation_token,
                RES_ACTIVE,
                RES_RELEASED,
            )
            .await?;
            if won == 0 {
                let current = db::get_reservation(&ctx.db, &res.reservation_token)
                    .await?
                    .map(|r| r.status)
                    .unwrap_or_else(|| "UNKNOWN".to_string());
                if current == RES_CONFIRMED {
                    return Err(EngineError::Conflict(
                        "reservation has already been confirmed".to_string(),
                        Some(format!("status={}", RES_CONFIRMED)),
                    ));
                }
                return Ok(ReleaseOutcome { released: false, status: current });
            }

            release_lock_quietly(&ctx.locks, &res.seat_id, &res.reservation_token).await;
            info!(
                "Reservation '{}' released by user '{}' for seat '{}'.",
                res.reservation_token, rqctx.user.user_id, res.seat_id
            );
            Ok(ReleaseOutcome { released: true, status: RES_RELEASED.to_string() })
        }
    }
}

// ---------------------------------------------------------------------------
// create_order:
// ---------------------------------------------------------------------------
/** Create (or return) the gateway order for a reservation.  Idempotent by
 * reservation token: repeats observe the first order.
 */
pub async fn create_order(
    ctx: &RuntimeCtx,
    rqctx: &RequestCtx,
    req: &CreateOrderRequest,
) -> Result<OrderOutcome, EngineError> {
    let res = db::get_reservation(&ctx.db, &req.reservation_token)
        .await?
        .ok_or_else(|| EngineError::NotFound("reservation not found".to_string()))?;
    if res.user_id != rqctx.user.user_id || res.tenant_id != rqctx.tenant.tenant_id {
        return Err(EngineError::conflict("reservation does not belong to requester"));
    }
    if res.status != RES_ACTIVE {
        return Err(EngineError::Conflict(
            format!("reservation is not active (status={})", res.status),
            Some(format!("status={}", res.status)),
        ));
    }

    // Repeats return the original order.
    if let Some(existing) = db::get_order_by_token(&ctx.db, &res.reservation_token).await? {
        return Ok(order_outcome(ctx, existing));
    }

    let amount = req.amount.unwrap_or(res.price);
    if amount != res.price {
        return Err(EngineError::Validation(format!(
            "amount {} does not match the reserved seat price {}",
            amount, res.price
        )));
    }
    let currency = req.currency.clone().unwrap_or_else(|| req_currency(ctx));

    let order_id = format!("ORD-{}", Uuid::new_v4().as_hyphenated());
    let inserted = db::insert_order(
        &ctx.db,
        &order_id,
        &res.reservation_token,
        &res.tenant_id,
        &res.user_id,
        amount,
        &currency,
    )
    .await?;

    match inserted {
        Some(_) => {
            let order = db::get_order_by_token(&ctx.db, &res.reservation_token)
                .await?
                .ok_or_else(|| {
                    EngineError::StoreUnavailable("order vanished after insert".to_string())
                })?;
            Ok(order_outcome(ctx, order))
        }
        // Lost the unique-index race; the winner's order is the order.
        None => {
            let order = db::get_order_by_token(&ctx.db, &res.reservation_token)
                .await?
                .ok_or_else(|| {
                    EngineError::StoreUnavailable("order not readable after conflict".to_string())
                })?;
            Ok(order_outcome(ctx, order))
        }
    }
}

// ---------------------------------------------------------------------------
// my_bookings:
// ---------------------------------------------------------------------------
/** One page of the requesting user's bookings within the tenant, newest
 * first.
 */
pub async fn my_bookings(
    ctx: &RuntimeCtx,
    rqctx: &RequestCtx,
    req: &BookingsPageRequest,
) -> Result<BookingsPage, EngineError> {
    if req.page < 1 {
        return Err(EngineError::Validation("page must be >= 1".to_string()));
    }
    let limit = req.limit.clamp(1, 100);
    let offset = (req.page - 1) * limit;

    let (bookings, total) = db::list_user_bookings(
        &ctx.db,
        &rqctx.tenant.tenant_id,
        &rqctx.user.user_id,
        limit,
        offset,
    )
    .await?;

    Ok(BookingsPage { bookings, total, page: req.page, limit })
}

// ---------------------------------------------------------------------------
// janitor_loop:
// ---------------------------------------------------------------------------
/** Periodic reconciliation of ACTIVE rows whose locks have already vanished.
 * Not required for correctness; the read paths expire lazily.
 */
pub async fn janitor_loop(ctx: Arc<RuntimeCtx>) {
    let interval = ctx.parms.config.janitor_interval_seconds;
    if interval == 0 {
        info!("Reservation janitor disabled.");
        return;
    }
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval));
    // The first tick fires immediately; skip it so boot stays quiet.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match db::expire_stale_reservations(&ctx.db).await {
            Ok(0) => (),
            Ok(n) => info!("Janitor expired {} stale reservations.", n),
            Err(e) => warn!("Janitor sweep failed: {}", e),
        }
    }
}

// ***************************************************************************
//                          Private Functions
// ***************************************************************************
fn req_currency(ctx: &RuntimeCtx) -> String {
    ctx.parms.config.payment.currency.clone()
}

fn order_outcome(ctx: &RuntimeCtx, order: crate::utils::db_types::Order) -> OrderOutcome {
    OrderOutcome {
        order_id: order.order_id,
        reservation_token: order.reservation_token,
        amount: order.amount,
        currency: order.currency,
        gateway_key: ctx.parms.config.payment.gateway_key.clone(),
    }
}

// ---------------------------------------------------------------------------
// release_lock_quietly:
// ---------------------------------------------------------------------------
/** Compare-and-delete the seat lock, logging instead of failing: the lock
 * self-expires, so a missed delete only costs availability until TTL.
 */
async fn release_lock_quietly(locks: &Arc<dyn LockStore>, seat_id: &str, token: &str) {
    if let Err(e) = locks.release(seat_id, Some(token)).await {
        warn!("Unable to release lock for seat '{}': {}", seat_id, e);
    }
}

// ---------------------------------------------------------------------------
// LockGuard:
// ---------------------------------------------------------------------------
/** Owns the just-acquired lock until the reservation row is durable.  If
 * the future is dropped (client disconnect, deadline) before disarm, the
 * drop handler spawns the compare-and-delete so the compensation still runs
 * after this task is gone.
 */
struct LockGuard {
    locks: Arc<dyn LockStore>,
    seat_id: String,
    token: String,
    armed: bool,
}

impl LockGuard {
    fn new(locks: Arc<dyn LockStore>, seat_id: &str, token: &str) -> Self {
        Self { locks, seat_id: seat_id.to_string(), token: token.to_string(), armed: true }
    }

    /// The lock now belongs to the durable reservation.
    fn disarm(mut self) {
        self.armed = false;
    }

    /// Synchronous-path compensation: release before surfacing an error.
    async fn release_now(mut self) {
        self.armed = false;
        release_lock_quietly(&self.locks, &self.seat_id, &self.token).await;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let locks = self.locks.clone();
        let seat_id = std::mem::take(&mut self.seat_id);
        let token = std::mem::take(&mut self.token);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                release_lock_quietly(&locks, &seat_id, &token).await;
            });
        } else {
            warn!("No runtime to release lock for seat '{}'; waiting out TTL.", seat_id);
        }
    }
}

// ***************************************************************************
//                                  Tests
// ***************************************************************************
#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::authz::{RequestCtx, TenantCtx, UserCtx};
    use crate::utils::db_types::SEAT_BOOKED;
    use crate::utils::test_support::{test_ctx, test_ctx_with_ttl};
    use futures::future::join_all;

    fn rqctx(tenant: &str, user: &str) -> RequestCtx {
        RequestCtx {
            tenant: TenantCtx { tenant_id: tenant.to_string(), domain: "events".to_string() },
            user: UserCtx { user_id: user.to_string(), email: None, name: None },
        }
    }

    fn reference(payment_id: &str) -> PaymentProof {
        PaymentProof::Reference { payment_id: payment_id.to_string() }
    }

    async fn seat_row(ctx: &RuntimeCtx, seat_id: &str) -> Seat {
        db::get_seat(&ctx.db, seat_id).await.unwrap().unwrap()
    }

    async fn reservation_status(ctx: &RuntimeCtx, token: &str) -> String {
        db::get_reservation(&ctx.db, token).await.unwrap().unwrap().status
    }

    // -------------------------------------------------------------------
    // Scenario 1: race of ten reserves on one seat.
    // -------------------------------------------------------------------
    #[tokio::test]
    async fn race_of_ten_reserves_on_one_seat() {
        let ctx = test_ctx().await;

        let tasks: Vec<_> = (0..10)
            .map(|i| {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let caller = rqctx("acme", &format!("user-{}", i));
                    reserve(&ctx, &caller, &ReserveRequest { seat_id: "S1".to_string() }).await
                })
            })
            .collect();

        let mut winners = Vec::new();
        let mut lock_errors = 0;
        for outcome in join_all(tasks).await {
            match outcome.unwrap() {
                Ok(r) => winners.push(r),
                Err(EngineError::SeatLock { expires_in }) => {
                    assert!(expires_in > 0 && expires_in <= 120, "expires_in={}", expires_in);
                    lock_errors += 1;
                }
                Err(other) => panic!("unexpected error: {:?}", other),
            }
        }
        assert_eq!(winners.len(), 1);
        assert_eq!(lock_errors, 9);
        assert_eq!(winners[0].ttl_seconds, 120);

        // Durable state: the seat is still AVAILABLE and exactly one
        // ACTIVE reservation exists.
        assert_eq!(seat_row(&ctx, "S1").await.status, SEAT_AVAILABLE);
        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM reservations WHERE seat_id = 'S1' AND status = 'ACTIVE'",
        )
        .fetch_one(&ctx.db)
        .await
        .unwrap();
        assert_eq!(active, 1);
    }

    // -------------------------------------------------------------------
    // Scenario 2: happy-path confirm.
    // -------------------------------------------------------------------
    #[tokio::test]
    async fn happy_path_confirm() {
        let ctx = test_ctx().await;
        let caller = rqctx("acme", "user-1");

        let reserved = reserve(&ctx, &caller, &ReserveRequest { seat_id: "S2".to_string() })
            .await
            .unwrap();
        assert_eq!(reserved.seat.price, 100);

        let confirmed = confirm(
            &ctx,
            &caller,
            &ConfirmRequest {
                reservation_token: reserved.reservation_token.clone(),
                proof: reference("PAY-OK-1"),
            },
        )
        .await
        .unwrap();

        let booking = &confirmed.booking;
        assert_eq!(booking.payment_status, "SUCCESS");
        assert_eq!(booking.amount, 100);
        assert_eq!(booking.payment_reference, "PAY-OK-1");

        // BK-YYYYMMDD-XXXXXX
        assert_eq!(booking.booking_id.len(), 18);
        assert!(booking.booking_id.starts_with("BK-"));
        assert!(booking.booking_id[12..]
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));

        // Seat flipped and back-referenced; lock gone; audit terminal.
        let seat = seat_row(&ctx, "S2").await;
        assert_eq!(seat.status, SEAT_BOOKED);
        assert_eq!(seat.booked_by.as_deref(), Some("user-1"));
        assert_eq!(seat.booking_ref.as_deref(), Some(booking.booking_id.as_str()));
        assert!(ctx.locks.inspect("S2").await.unwrap().is_none());
        assert_eq!(reservation_status(&ctx, &reserved.reservation_token).await, "CONFIRMED");
    }

    // -------------------------------------------------------------------
    // Scenario 3: TTL expiry.
    // -------------------------------------------------------------------
    #[tokio::test]
    async fn confirm_after_ttl_expiry() {
        let ctx = test_ctx_with_ttl(1).await;
        let caller = rqctx("acme", "user-1");

        let reserved = reserve(&ctx, &caller, &ReserveRequest { seat_id: "S3".to_string() })
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1200)).await;

        let err = confirm(
            &ctx,
            &caller,
            &ConfirmRequest {
                reservation_token: reserved.reservation_token.clone(),
                proof: reference("PAY-OK-1"),
            },
        )
        .await
        .unwrap_err();
        match err {
            EngineError::Conflict(msg, _) => assert!(msg.contains("expired")),
            other => panic!("expected Conflict(expired), got {:?}", other),
        }
        assert_eq!(reservation_status(&ctx, &reserved.reservation_token).await, "EXPIRED");

        // The seat is immediately reservable by another user.
        let second = rqctx("acme", "user-2");
        let again = reserve(&ctx, &second, &ReserveRequest { seat_id: "S3".to_string() })
            .await
            .unwrap();
        assert_ne!(again.reservation_token, reserved.reservation_token);
    }

    // -------------------------------------------------------------------
    // Scenario 4: cross-tenant leak attempt.
    // -------------------------------------------------------------------
    #[tokio::test]
    async fn cross_tenant_confirm_is_a_conflict() {
        let ctx = test_ctx().await;
        let tenant_a = rqctx("acme", "user-1");
        let tenant_b = rqctx("beta", "user-b");

        let reserved = reserve(&ctx, &tenant_a, &ReserveRequest { seat_id: "S4".to_string() })
            .await
            .unwrap();

        let err = confirm(
            &ctx,
            &tenant_b,
            &ConfirmRequest {
                reservation_token: reserved.reservation_token.clone(),
                proof: reference("PAY-OK-1"),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(..)));

        // Nothing moved.
        assert_eq!(seat_row(&ctx, "S4").await.status, SEAT_AVAILABLE);
        assert_eq!(reservation_status(&ctx, &reserved.reservation_token).await, "ACTIVE");
    }

    // -------------------------------------------------------------------
    // Scenario 5: double-confirm idempotence.
    // -------------------------------------------------------------------
    #[tokio::test]
    async fn double_confirm_reports_existing_booking() {
        let ctx = test_ctx().await;
        let caller = rqctx("acme", "user-1");

        let reserved = reserve(&ctx, &caller, &ReserveRequest { seat_id: "S5".to_string() })
            .await
            .unwrap();
        let req = ConfirmRequest {
            reservation_token: reserved.reservation_token.clone(),
            proof: reference("PAY-OK-1"),
        };
        let first = confirm(&ctx, &caller, &req).await.unwrap();

        let err = confirm(&ctx, &caller, &req).await.unwrap_err();
        match err {
            EngineError::Conflict(_, details) => {
                let details = details.expect("details carry the booking id");
                assert!(details.contains("status=CONFIRMED"));
                assert!(details.contains(&first.booking.booking_id));
            }
            other => panic!("expected Conflict, got {:?}", other),
        }

        // The booking stays discoverable through my-bookings.
        let page = my_bookings(&ctx, &caller, &BookingsPageRequest { page: 1, limit: 20 })
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.bookings[0].booking_id, first.booking.booking_id);
    }

    // -------------------------------------------------------------------
    // Scenario 6: release races confirm.
    // -------------------------------------------------------------------
    #[tokio::test]
    async fn release_races_confirm() {
        let ctx = test_ctx().await;
        let caller = rqctx("acme", "user-1");

        let reserved = reserve(&ctx, &caller, &ReserveRequest { seat_id: "S6".to_string() })
            .await
            .unwrap();
        let token = reserved.reservation_token.clone();

        let confirm_task = {
            let ctx = ctx.clone();
            let caller = caller.clone();
            let token = token.clone();
            tokio::spawn(async move {
                confirm(
                    &ctx,
                    &caller,
                    &ConfirmRequest { reservation_token: token, proof: reference("PAY-OK-1") },
                )
                .await
            })
        };
        let release_task = {
            let ctx = ctx.clone();
            let caller = caller.clone();
            let token = token.clone();
            tokio::spawn(async move {
                release(&ctx, &caller, &ReleaseRequest { reservation_token: token }).await
            })
        };

        let confirm_result = confirm_task.await.unwrap();
        let release_result = release_task.await.unwrap();

        match (&confirm_result, &release_result) {
            // Confirm won: the booking exists and release reports it.
            (Ok(_), Err(EngineError::Conflict(_, details))) => {
                assert_eq!(seat_row(&ctx, "S6").await.status, SEAT_BOOKED);
                assert!(details.as_deref().unwrap_or("").contains("CONFIRMED"));
            }
            // Release won (or release returned idempotent no-op after losing
            // the lock but before confirm committed is impossible: released
            // is only true when release won the guarded update).
            (Err(e), Ok(out)) => {
                assert!(out.released);
                assert!(
                    matches!(e, EngineError::SeatLock { .. })
                        || matches!(e, EngineError::Conflict(..)),
                    "confirm loser error: {:?}",
                    e
                );
                assert_eq!(seat_row(&ctx, "S6").await.status, SEAT_AVAILABLE);
                assert_eq!(reservation_status(&ctx, &token).await, "RELEASED");
            }
            other => panic!("exactly one of confirm/release must win: {:?}", other),
        }
    }

    // -------------------------------------------------------------------
    // A lapsed lock with no confirm and no janitor must not let a second
    // reserve stack another ACTIVE row on the seat.
    // -------------------------------------------------------------------
    #[tokio::test]
    async fn second_reserve_after_ttl_expiry_keeps_one_active_row() {
        let ctx = test_ctx_with_ttl(1).await;
        let first_user = rqctx("acme", "user-1");
        let second_user = rqctx("acme", "user-2");

        let first = reserve(&ctx, &first_user, &ReserveRequest { seat_id: "S4".to_string() })
            .await
            .unwrap();

        // Let the lock lapse naturally; nobody confirms the stale token and
        // the janitor never runs in these tests.
        tokio::time::sleep(std::time::Duration::from_millis(1200)).await;

        let second = reserve(&ctx, &second_user, &ReserveRequest { seat_id: "S4".to_string() })
            .await
            .unwrap();
        assert_ne!(second.reservation_token, first.reservation_token);

        // The stale row was retired, so at most one ACTIVE row exists.
        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM reservations WHERE seat_id = 'S4' AND status = 'ACTIVE'",
        )
        .fetch_one(&ctx.db)
        .await
        .unwrap();
        assert_eq!(active, 1);
        assert_eq!(reservation_status(&ctx, &first.reservation_token).await, "EXPIRED");
        assert_eq!(reservation_status(&ctx, &second.reservation_token).await, "ACTIVE");
    }

    // -------------------------------------------------------------------
    // The store itself refuses a second ACTIVE row per seat.
    // -------------------------------------------------------------------
    #[tokio::test]
    async fn active_reservation_is_unique_per_seat_in_the_store() {
        let ctx = test_ctx().await;
        let now = timestamp_utc();
        let now_str = timestamp_utc_to_str(now);
        let expires = timestamp_utc_to_str(now + chrono::Duration::seconds(120));

        let row = |token: &str| {
            ReservationInput::new(
                token.to_string(),
                "acme".to_string(),
                "user-1".to_string(),
                "S5".to_string(),
                "EVT-1".to_string(),
                5,
                100,
                expires.clone(),
                now_str.clone(),
                now_str.clone(),
            )
        };

        db::insert_reservation(&ctx.db, row("tok-one")).await.unwrap();
        let err = db::insert_reservation(&ctx.db, row("tok-two")).await.unwrap_err();
        match err {
            EngineError::Conflict(msg, _) => assert!(msg.contains("active reservation")),
            other => panic!("expected Conflict, got {:?}", other),
        }
    }

    // -------------------------------------------------------------------
    // Reserve screening.
    // -------------------------------------------------------------------
    #[tokio::test]
    async fn reserve_screens_missing_foreign_and_booked_seats() {
        let ctx = test_ctx().await;
        let caller = rqctx("acme", "user-1");

        let err = reserve(&ctx, &caller, &ReserveRequest { seat_id: "nope".to_string() })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));

        // Beta's seat is invisible to acme.
        let err = reserve(&ctx, &caller, &ReserveRequest { seat_id: "B1".to_string() })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(..)));

        // Book S7, then try to reserve it again.
        let reserved = reserve(&ctx, &caller, &ReserveRequest { seat_id: "S7".to_string() })
            .await
            .unwrap();
        confirm(
            &ctx,
            &caller,
            &ConfirmRequest {
                reservation_token: reserved.reservation_token,
                proof: reference("PAY-OK-1"),
            },
        )
        .await
        .unwrap();
        let err = reserve(&ctx, &caller, &ReserveRequest { seat_id: "S7".to_string() })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(..)));
    }

    // -------------------------------------------------------------------
    // Release idempotence: reserve then release leaves the seat free with
    // no lock; a repeat release succeeds without mutation.
    // -------------------------------------------------------------------
    #[tokio::test]
    async fn release_is_idempotent() {
        let ctx = test_ctx().await;
        let caller = rqctx("acme", "user-1");

        let reserved = reserve(&ctx, &caller, &ReserveRequest { seat_id: "S1".to_string() })
            .await
            .unwrap();
        let req = ReleaseRequest { reservation_token: reserved.reservation_token.clone() };

        let first = release(&ctx, &caller, &req).await.unwrap();
        assert!(first.released);
        assert_eq!(seat_row(&ctx, "S1").await.status, SEAT_AVAILABLE);
        assert!(ctx.locks.inspect("S1").await.unwrap().is_none());

        let second = release(&ctx, &caller, &req).await.unwrap();
        assert!(!second.released);
        assert_eq!(second.status, "RELEASED");

        // And the seat is immediately reservable again.
        assert!(reserve(&ctx, &caller, &ReserveRequest { seat_id: "S1".to_string() })
            .await
            .is_ok());
    }

    // -------------------------------------------------------------------
    // Listing filters live locks and honors price bounds.
    // -------------------------------------------------------------------
    #[tokio::test]
    async fn listing_filters_locked_seats() {
        let ctx = test_ctx().await;
        let caller = rqctx("acme", "user-1");
        let other = rqctx("acme", "user-2");

        reserve(&ctx, &other, &ReserveRequest { seat_id: "S5".to_string() }).await.unwrap();

        let req = ListSeatsRequest {
            entity_id: "EVT-1".to_string(),
            min_price: None,
            max_price: None,
        };
        let seats = list_seats(&ctx, &caller, &req).await.unwrap();
        assert_eq!(seats.len(), 7);
        assert!(seats.iter().all(|s| s.seat_id != "S5"));
        // Ordered by seat number.
        let numbers: Vec<i64> = seats.iter().map(|s| s.seat_number).collect();
        let mut sorted = numbers.clone();
        sorted.sort_unstable();
        assert_eq!(numbers, sorted);

        // Price bounds exclude everything here.
        let req = ListSeatsRequest {
            entity_id: "EVT-1".to_string(),
            min_price: Some(200),
            max_price: None,
        };
        assert!(list_seats(&ctx, &caller, &req).await.unwrap().is_empty());

        let err = list_seats(
            &ctx,
            &caller,
            &ListSeatsRequest {
                entity_id: "EVT-1".to_string(),
                min_price: Some(50),
                max_price: Some(10),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    // -------------------------------------------------------------------
    // create-order is idempotent by reservation token.
    // -------------------------------------------------------------------
    #[tokio::test]
    async fn create_order_is_idempotent() {
        let ctx = test_ctx().await;
        let caller = rqctx("acme", "user-1");

        let reserved = reserve(&ctx, &caller, &ReserveRequest { seat_id: "S2".to_string() })
            .await
            .unwrap();
        let req = CreateOrderRequest {
            reservation_token: reserved.reservation_token.clone(),
            amount: None,
            currency: None,
        };

        let first = create_order(&ctx, &caller, &req).await.unwrap();
        assert_eq!(first.amount, 100);
        assert!(first.order_id.starts_with("ORD-"));

        let second = create_order(&ctx, &caller, &req).await.unwrap();
        assert_eq!(second.order_id, first.order_id);

        // Idempotent read wins over amount validation once the order exists.
        let repeat = create_order(
            &ctx,
            &caller,
            &CreateOrderRequest {
                reservation_token: reserved.reservation_token.clone(),
                amount: Some(1),
                currency: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(repeat.order_id, first.order_id);

        // After release the token is no longer orderable.
        release(
            &ctx,
            &caller,
            &ReleaseRequest { reservation_token: reserved.reservation_token.clone() },
        )
        .await
        .unwrap();
        let err = create_order(&ctx, &caller, &req).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(..)));
    }

    // -------------------------------------------------------------------
    // Payment failure keeps the lock for a retry; the retry succeeds.
    // -------------------------------------------------------------------
    #[tokio::test]
    async fn payment_failure_retains_lock_for_retry() {
        let ctx = test_ctx().await;
        let caller = rqctx("acme", "user-1");

        let reserved = reserve(&ctx, &caller, &ReserveRequest { seat_id: "S3".to_string() })
            .await
            .unwrap();

        let err = confirm(
            &ctx,
            &caller,
            &ConfirmRequest {
                reservation_token: reserved.reservation_token.clone(),
                proof: reference("garbage-ref"),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Payment(_)));

        // Lock retained, audit row still ACTIVE.
        assert!(ctx.locks.inspect("S3").await.unwrap().is_some());
        assert_eq!(reservation_status(&ctx, &reserved.reservation_token).await, "ACTIVE");

        // Corrected payment goes through.
        let confirmed = confirm(
            &ctx,
            &caller,
            &ConfirmRequest {
                reservation_token: reserved.reservation_token.clone(),
                proof: reference("PAY-OK-2"),
            },
        )
        .await
        .unwrap();
        assert_eq!(confirmed.booking.payment_reference, "PAY-OK-2");
    }

    // -------------------------------------------------------------------
    // The janitor flips stale ACTIVE rows to EXPIRED.
    // -------------------------------------------------------------------
    #[tokio::test]
    async fn janitor_expires_stale_rows() {
        let ctx = test_ctx_with_ttl(1).await;
        let caller = rqctx("acme", "user-1");

        let reserved = reserve(&ctx, &caller, &ReserveRequest { seat_id: "S8".to_string() })
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1200)).await;

        let swept = db::expire_stale_reservations(&ctx.db).await.unwrap();
        assert_eq!(swept, 1);
        assert_eq!(reservation_status(&ctx, &reserved.reservation_token).await, "EXPIRED");
    }

    // -------------------------------------------------------------------
    // Paged bookings, newest first.
    // -------------------------------------------------------------------
    #[tokio::test]
    async fn my_bookings_pages_newest_first() {
        let ctx = test_ctx().await;
        let caller = rqctx("acme", "user-1");

        for seat in ["S1", "S2", "S3"] {
            let reserved = reserve(&ctx, &caller, &ReserveRequest { seat_id: seat.to_string() })
                .await
                .unwrap();
            confirm(
                &ctx,
                &caller,
                &ConfirmRequest {
                    reservation_token: reserved.reservation_token,
                    proof: reference("PAY-OK-1"),
                },
            )
            .await
            .unwrap();
        }

        let page = my_bookings(&ctx, &caller, &BookingsPageRequest { page: 1, limit: 2 })
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.bookings.len(), 2);
        // Newest (S3) first.
        assert_eq!(page.bookings[0].seat_id, "S3");

        let page2 = my_bookings(&ctx, &caller, &BookingsPageRequest { page: 2, limit: 2 })
            .await
            .unwrap();
        assert_eq!(page2.bookings.len(), 1);
        assert_eq!(page2.bookings[0].seat_id, "S1");

        let err = my_bookings(&ctx, &caller, &BookingsPageRequest { page: 0, limit: 2 })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    // -------------------------------------------------------------------
    // Cancellation between acquire and insert still releases the lock.
    // -------------------------------------------------------------------
    #[tokio::test]
    async fn dropped_guard_releases_lock() {
        let ctx = test_ctx().await;
        let lock = match ctx.locks.acquire("S1", "user-1", 120).await.unwrap() {
            AcquireOutcome::Acquired(l) => l,
            other => panic!("expected Acquired, got {:?}", other),
        };

        {
            let _guard = LockGuard::new(ctx.locks.clone(), "S1", &lock.token);
            // Dropped armed, as if the reserve future were cancelled here.
        }
        // The spawned compensation runs on this runtime.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(ctx.locks.inspect("S1").await.unwrap().is_none());
    }
}
