#![forbid(unsafe_code)]

use log::{info, warn};
use sqlx::{Pool, Row, Sqlite};

use crate::utils::authz::hash_tenant_secret;
use crate::utils::config::{RuntimeCtx, SQLITE_TRUE};
use crate::utils::db_statements::*;
use crate::utils::db_types::*;
use crate::utils::errors::EngineError;
use crate::utils::sbs_utils::{generate_booking_id, timestamp_utc, timestamp_utc_to_str};

// Booking-id collisions are resolved by regeneration inside the confirm
// transaction; the suffix space makes more attempts pointless.
const MAX_BOOKING_ID_ATTEMPTS: u32 = 5;

// ***************************************************************************
//                              Read Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// get_tenant:
// ---------------------------------------------------------------------------
pub async fn get_tenant(db: &Pool<Sqlite>, tenant_id: &str) -> Result<Option<Tenant>, EngineError> {
    let tenant = sqlx::query_as::<_, Tenant>(SELECT_TENANT_BY_ID)
        .bind(tenant_id)
        .fetch_optional(db)
        .await?;
    Ok(tenant)
}

// ---------------------------------------------------------------------------
// get_user:
// ---------------------------------------------------------------------------
pub async fn get_user(db: &Pool<Sqlite>, user_id: &str) -> Result<Option<User>, EngineError> {
    let user = sqlx::query_as::<_, User>(SELECT_USER_BY_ID)
        .bind(user_id)
        .fetch_optional(db)
        .await?;
    Ok(user)
}

// ---------------------------------------------------------------------------
// get_seat:
// ---------------------------------------------------------------------------
pub async fn get_seat(db: &Pool<Sqlite>, seat_id: &str) -> Result<Option<Seat>, EngineError> {
    let seat = sqlx::query_as::<_, Seat>(SELECT_SEAT_BY_SEAT_ID)
        .bind(seat_id)
        .fetch_optional(db)
        .await?;
    Ok(seat)
}

// ---------------------------------------------------------------------------
// list_available_seats:
// ---------------------------------------------------------------------------
/** All AVAILABLE seats for a tenant/entity pair ordered by seat number,
 * optionally bounded by an inclusive price range.
 */
pub async fn list_available_seats(
    db: &Pool<Sqlite>,
    tenant_id: &str,
    entity_id: &str,
    min_price: Option<i64>,
    max_price: Option<i64>,
) -> Result<Vec<Seat>, EngineError> {
    let seats = sqlx::query_as::<_, Seat>(LIST_AVAILABLE_SEATS)
        .bind(tenant_id)
        .bind(entity_id)
        .bind(min_price)
        .bind(min_price)
        .bind(max_price)
        .bind(max_price)
        .fetch_all(db)
        .await?;
    Ok(seats)
}

// ---------------------------------------------------------------------------
// get_reservation:
// ---------------------------------------------------------------------------
pub async fn get_reservation(
    db: &Pool<Sqlite>,
    reservation_token: &str,
) -> Result<Option<Reservation>, EngineError> {
    let res = sqlx::query_as::<_, Reservation>(SELECT_RESERVATION_BY_TOKEN)
        .bind(reservation_token)
        .fetch_optional(db)
        .await?;
    Ok(res)
}

// ---------------------------------------------------------------------------
// get_booking_by_token:
// ---------------------------------------------------------------------------
pub async fn get_booking_by_token(
    db: &Pool<Sqlite>,
    reservation_token: &str,
) -> Result<Option<Booking>, EngineError> {
    let booking = sqlx::query_as::<_, Booking>(SELECT_BOOKING_BY_TOKEN)
        .bind(reservation_token)
        .fetch_optional(db)
        .await?;
    Ok(booking)
}

// ---------------------------------------------------------------------------
// list_user_bookings:
// ---------------------------------------------------------------------------
/** One page of a user's bookings within a tenant, newest first. */
pub async fn list_user_bookings(
    db: &Pool<Sqlite>,
    tenant_id: &str,
    user_id: &str,
    limit: i64,
    offset: i64,
) -> Result<(Vec<Booking>, i64), EngineError> {
    let bookings = sqlx::query_as::<_, Booking>(LIST_USER_BOOKINGS)
        .bind(tenant_id)
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(db)
        .await?;

    let total: i64 = sqlx::query(COUNT_USER_BOOKINGS)
        .bind(tenant_id)
        .bind(user_id)
        .fetch_one(db)
        .await?
        .get(0);

    Ok((bookings, total))
}

// ---------------------------------------------------------------------------
// get_order_by_token:
// ---------------------------------------------------------------------------
pub async fn get_order_by_token(
    db: &Pool<Sqlite>,
    reservation_token: &str,
) -> Result<Option<Order>, EngineError> {
    let order = sqlx::query_as::<_, Order>(SELECT_ORDER_BY_TOKEN)
        .bind(reservation_token)
        .fetch_optional(db)
        .await?;
    Ok(order)
}

// ***************************************************************************
//                              Write Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// insert_reservation:
// ---------------------------------------------------------------------------
/** Insert the ACTIVE audit row.  The one-ACTIVE-per-seat unique index can
 * reject the insert when another live reservation still exists for the
 * seat; that surfaces as a Conflict, not a store fault.
 */
pub async fn insert_reservation(
    db: &Pool<Sqlite>,
    rec: ReservationInput,
) -> Result<u64, EngineError> {
    // Uncommitted transactions are automatically rolled back when they go
    // out of scope.  See https://docs.rs/sqlx/latest/sqlx/struct.Transaction.html.
    let mut tx = db.begin().await?;

    let result = sqlx::query(INSERT_RESERVATION)
        .bind(&rec.reservation_token)
        .bind(rec.tenant_id)
        .bind(rec.user_id)
        .bind(rec.seat_id)
        .bind(rec.entity_id)
        .bind(rec.seat_number)
        .bind(rec.price)
        .bind(rec.expires_at)
        .bind(rec.created)
        .bind(rec.updated)
        .execute(&mut *tx)
        .await;
    let result = match result {
        Ok(done) => done,
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            tx.rollback().await.ok();
            // SQLite names either the index or its column, depending on
            // the build.
            let msg = db_err.message();
            if msg.contains("idx_reservations_one_active") || msg.contains("reservations.seat_id")
            {
                return Err(EngineError::conflict("seat already has an active reservation"));
            }
            return Err(EngineError::conflict("reservation token already exists"));
        }
        Err(e) => {
            tx.rollback().await.ok();
            return Err(e.into());
        }
    };

    tx.commit().await?;
    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------------
// expire_stale_seat_reservations:
// ---------------------------------------------------------------------------
/** Retire any lapsed ACTIVE row for one seat.  Run by reserve while holding
 * the fresh seat lock: a prior holder's lock can vanish at TTL without any
 * confirm or janitor tick ever observing the stale audit row.
 */
pub async fn expire_stale_seat_reservations(
    db: &Pool<Sqlite>,
    seat_id: &str,
) -> Result<u64, EngineError> {
    let now_str = timestamp_utc_to_str(timestamp_utc());
    let result = sqlx::query(EXPIRE_STALE_SEAT_RESERVATIONS)
        .bind(&now_str)
        .bind(seat_id)
        .bind(&now_str)
        .execute(db)
        .await?;
    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------------
// update_reservation_status:
// ---------------------------------------------------------------------------
/** Guarded lifecycle transition.  Returns the number of rows changed: 1 when
 * this caller won the transition, 0 when the row was no longer in the
 * expected prior status.
 */
pub async fn update_reservation_status(
    db: &Pool<Sqlite>,
    reservation_token: &str,
    from_status: &str,
    to_status: &str,
) -> Result<u64, EngineError> {
    let now_str = timestamp_utc_to_str(timestamp_utc());
    let result = sqlx::query(UPDATE_RESERVATION_STATUS_GUARDED)
        .bind(to_status)
        .bind(&now_str)
        .bind(reservation_token)
        .bind(from_status)
        .execute(db)
        .await?;
    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------------
// run_confirm_transaction:
// ---------------------------------------------------------------------------
/** The single ACID transaction at the heart of confirmation.  Write order:
 * booking insert first, then one seat update carrying BOOKED, the booker and
 * the new booking id, then the guarded reservation transition.  Any guard
 * failing rolls the whole transaction back, leaving the lock untouched for
 * the caller to deal with.
 *
 * Booking-id collisions (same day, same random suffix) surface as a unique
 * violation on the booking insert and are retried with a fresh id inside
 * the same transaction.
 */
pub async fn run_confirm_transaction(
    db: &Pool<Sqlite>,
    res: &Reservation,
    payment_reference: &str,
    currency: &str,
) -> Result<Booking, EngineError> {
    let now = timestamp_utc();
    let now_str = timestamp_utc_to_str(now);

    let mut tx = db.begin().await?;

    // -------- Insert the booking, regenerating the id on collision.
    let mut booking_id = generate_booking_id(now);
    let mut attempt: u32 = 0;
    let booking_rowid = loop {
        attempt += 1;
        let insert = sqlx::query(INSERT_BOOKING)
            .bind(&booking_id)
            .bind(&res.tenant_id)
            .bind(&res.user_id)
            .bind(&res.seat_id)
            .bind(&res.reservation_token)
            .bind(PAYMENT_SUCCESS)
            .bind(payment_reference)
            .bind(res.price)
            .bind(currency)
            .bind(&now_str)
            .bind(&now_str)
            .bind(&now_str)
            .execute(&mut *tx)
            .await;
        match insert {
            Ok(done) => break done.last_insert_rowid(),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                // The token index firing means this reservation was already
                // consumed by a concurrent confirm.
                if db_err.message().contains("reservation_token") {
                    tx.rollback().await.ok();
                    return Err(EngineError::Conflict(
                        "reservation has already been confirmed".to_string(),
                        Some(format!("status={}", RES_CONFIRMED)),
                    ));
                }
                if attempt >= MAX_BOOKING_ID_ATTEMPTS {
                    tx.rollback().await.ok();
                    return Err(EngineError::StoreUnavailable(
                        "unable to allocate a unique booking id".to_string(),
                    ));
                }
                warn!("Booking id collision on '{}', regenerating.", booking_id);
                booking_id = generate_booking_id(now);
            }
            Err(e) => {
                tx.rollback().await.ok();
                return Err(e.into());
            }
        }
    };

    // -------- Flip the seat to BOOKED, carrying the booking back-reference.
    let seat_update = sqlx::query(UPDATE_SEAT_BOOKED)
        .bind(&res.user_id)
        .bind(&booking_id)
        .bind(&now_str)
        .bind(&res.seat_id)
        .execute(&mut *tx)
        .await?;
    if seat_update.rows_affected() == 0 {
        tx.rollback().await.ok();
        return Err(EngineError::conflict("seat is no longer available"));
    }

    // -------- Consume the reservation.
    let res_update = sqlx::query(UPDATE_RESERVATION_STATUS_GUARDED)
        .bind(RES_CONFIRMED)
        .bind(&now_str)
        .bind(&res.reservation_token)
        .bind(RES_ACTIVE)
        .execute(&mut *tx)
        .await?;
    if res_update.rows_affected() == 0 {
        tx.rollback().await.ok();
        return Err(EngineError::Conflict(
            "reservation is no longer active".to_string(),
            Some("status changed concurrently".to_string()),
        ));
    }

    tx.commit().await?;

    Ok(Booking {
        id: booking_rowid,
        booking_id,
        tenant_id: res.tenant_id.clone(),
        user_id: res.user_id.clone(),
        seat_id: res.seat_id.clone(),
        reservation_token: res.reservation_token.clone(),
        payment_status: PAYMENT_SUCCESS.to_string(),
        payment_reference: payment_reference.to_string(),
        amount: res.price,
        currency: currency.to_string(),
        booking_date: now_str.clone(),
        created: now_str.clone(),
        updated: now_str,
    })
}

// ---------------------------------------------------------------------------
// insert_order:
// ---------------------------------------------------------------------------
/** Insert a gateway order keyed by reservation token.  Returns None when a
 * concurrent insert won the unique index; the caller re-reads the winner.
 */
pub async fn insert_order(
    db: &Pool<Sqlite>,
    order_id: &str,
    reservation_token: &str,
    tenant_id: &str,
    user_id: &str,
    amount: i64,
    currency: &str,
) -> Result<Option<u64>, EngineError> {
    let now_str = timestamp_utc_to_str(timestamp_utc());
    let result = sqlx::query(INSERT_ORDER)
        .bind(order_id)
        .bind(reservation_token)
        .bind(tenant_id)
        .bind(user_id)
        .bind(amount)
        .bind(currency)
        .bind(&now_str)
        .bind(&now_str)
        .execute(db)
        .await;
    match result {
        Ok(done) => Ok(Some(done.rows_affected())),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// expire_stale_reservations:
// ---------------------------------------------------------------------------
/** Janitor sweep: flip every ACTIVE reservation whose expiry has passed to
 * EXPIRED.  Reconciliation only; the read paths handle expiry lazily.
 */
pub async fn expire_stale_reservations(db: &Pool<Sqlite>) -> Result<u64, EngineError> {
    let now_str = timestamp_utc_to_str(timestamp_utc());
    let result = sqlx::query(EXPIRE_STALE_RESERVATIONS)
        .bind(&now_str)
        .bind(&now_str)
        .execute(db)
        .await?;
    Ok(result.rows_affected())
}

// ***************************************************************************
//                           Seeding Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// insert_tenant:
// ---------------------------------------------------------------------------
pub async fn insert_tenant(
    db: &Pool<Sqlite>,
    tenant_id: &str,
    secret_hash: &str,
    domain: &str,
    allowed_origins: &str,
) -> Result<u64, EngineError> {
    let now_str = timestamp_utc_to_str(timestamp_utc());
    let result = sqlx::query(INSERT_TENANT)
        .bind(tenant_id)
        .bind(secret_hash)
        .bind(domain)
        .bind(allowed_origins)
        .bind(SQLITE_TRUE)
        .bind(&now_str)
        .bind(&now_str)
        .execute(db)
        .await?;
    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------------
// insert_user:
// ---------------------------------------------------------------------------
pub async fn insert_user(
    db: &Pool<Sqlite>,
    user_id: &str,
    email: &str,
    name: &str,
) -> Result<u64, EngineError> {
    let now_str = timestamp_utc_to_str(timestamp_utc());
    let result = sqlx::query(INSERT_USER)
        .bind(user_id)
        .bind(email)
        .bind(name)
        .bind(SQLITE_TRUE)
        .bind(&now_str)
        .bind(&now_str)
        .execute(db)
        .await?;
    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------------
// insert_seat:
// ---------------------------------------------------------------------------
pub async fn insert_seat(db: &Pool<Sqlite>, rec: SeatInput) -> Result<u64, EngineError> {
    let now_str = timestamp_utc_to_str(timestamp_utc());
    let result = sqlx::query(INSERT_SEAT)
        .bind(rec.seat_id)
        .bind(rec.tenant_id)
        .bind(rec.entity_id)
        .bind(rec.seat_number)
        .bind(rec.price)
        .bind(rec.metadata)
        .bind(&now_str)
        .bind(&now_str)
        .execute(db)
        .await?;
    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------------
// check_dev_seed:
// ---------------------------------------------------------------------------
/** Populate a development tenant, user and seat block when seed_dev_data is
 * configured.  All inserts are idempotent, so repeated boots are harmless.
 */
pub async fn check_dev_seed(ctx: &RuntimeCtx) {
    const DEV_TENANT: &str = "devtenant";
    const DEV_SECRET: &str = "devsecret";
    const DEV_USER: &str = "dev-user-1";
    const DEV_ENTITY: &str = "EVT-100";
    const DEV_SEAT_COUNT: i64 = 10;
    const DEV_SEAT_PRICE: i64 = 100;

    if !ctx.parms.config.seed_dev_data {
        return;
    }

    match seed_dev_data(
        ctx, DEV_TENANT, DEV_SECRET, DEV_USER, DEV_ENTITY, DEV_SEAT_COUNT, DEV_SEAT_PRICE,
    )
    .await
    {
        Ok(n) => {
            if n > 0 {
                info!("Development seed inserted {} records (tenant '{}').", n, DEV_TENANT);
            }
        }
        Err(e) => {
            warn!("Ignoring error while inserting development seed records: {}", e);
        }
    }
}

async fn seed_dev_data(
    ctx: &RuntimeCtx,
    tenant_id: &str,
    secret: &str,
    user_id: &str,
    entity_id: &str,
    seat_count: i64,
    price: i64,
) -> Result<u64, EngineError> {
    let mut inserted: u64 = 0;

    let hash = hash_tenant_secret(secret, ctx.parms.config.tenant_secret_hash_cost)?;
    inserted += insert_tenant(&ctx.db, tenant_id, &hash, "events", "[]").await?;
    inserted += insert_user(&ctx.db, user_id, "dev@example.com", "Dev User").await?;

    for n in 1..=seat_count {
        let rec = SeatInput::new(
            format!("{}-{}-{}", tenant_id, entity_id, n),
            tenant_id.to_string(),
            entity_id.to_string(),
            n,
            price,
            "{}".to_string(),
        );
        inserted += insert_seat(&ctx.db, rec).await?;
    }

    Ok(inserted)
}
