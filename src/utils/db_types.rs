// This file contains the SBS database structs and related definitions.
#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// status constants:
// ---------------------------------------------------------------------------
// Seat durable status.
pub const SEAT_AVAILABLE: &str = "AVAILABLE";
pub const SEAT_BOOKED: &str = "BOOKED";

// Reservation lifecycle.  ACTIVE transitions one-way to any of the other
// three; all three are terminal.
pub const RES_ACTIVE: &str = "ACTIVE";
pub const RES_EXPIRED: &str = "EXPIRED";
pub const RES_CONFIRMED: &str = "CONFIRMED";
pub const RES_RELEASED: &str = "RELEASED";

// Booking payment status; bookings only exist after a successful payment.
pub const PAYMENT_SUCCESS: &str = "SUCCESS";

// ---------------------------------------------------------------------------
// tenants:
// ---------------------------------------------------------------------------
#[allow(dead_code)]
#[derive(Debug, FromRow)]
pub struct Tenant {
    pub id: i64,
    pub tenant_id: String,
    pub secret_hash: String,
    pub domain: String,
    /// JSON array of allowed origin patterns; empty means "use the
    /// configured default".
    pub allowed_origins: String,
    pub enabled: i64,
    pub created: String,
    pub updated: String,
}

impl Tenant {
    pub fn origin_patterns(&self) -> Vec<String> {
        serde_json::from_str(&self.allowed_origins).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// users:
// ---------------------------------------------------------------------------
#[allow(dead_code)]
#[derive(Debug, FromRow)]
pub struct User {
    pub id: i64,
    pub user_id: String,
    pub email: String,
    pub name: String,
    pub enabled: i64,
    pub created: String,
    pub updated: String,
}

// ---------------------------------------------------------------------------
// seats:
// ---------------------------------------------------------------------------
#[allow(dead_code)]
#[derive(Debug, Clone, FromRow)]
pub struct Seat {
    pub id: i64,
    pub seat_id: String,
    pub tenant_id: String,
    pub entity_id: String,
    pub seat_number: i64,
    pub price: i64,
    pub metadata: String,
    pub status: String,
    pub booked_by: Option<String>,
    pub booking_ref: Option<String>,
    pub created: String,
    pub updated: String,
}

#[derive(Debug)]
pub struct SeatInput {
    pub seat_id: String,
    pub tenant_id: String,
    pub entity_id: String,
    pub seat_number: i64,
    pub price: i64,
    pub metadata: String,
}

impl SeatInput {
    pub fn new(
        seat_id: String,
        tenant_id: String,
        entity_id: String,
        seat_number: i64,
        price: i64,
        metadata: String,
    ) -> SeatInput {
        SeatInput { seat_id, tenant_id, entity_id, seat_number, price, metadata }
    }
}

// ---------------------------------------------------------------------------
// reservations:
// ---------------------------------------------------------------------------
#[allow(dead_code)]
#[derive(Debug, Clone, FromRow)]
pub struct Reservation {
    pub id: i64,
    pub reservation_token: String,
    pub tenant_id: String,
    pub user_id: String,
    pub seat_id: String,
    pub entity_id: String,
    pub seat_number: i64,
    pub price: i64,
    pub status: String,
    pub expires_at: String,
    pub created: String,
    pub updated: String,
}

/// Insert image of a new ACTIVE reservation with its seat snapshot.
#[derive(Debug)]
pub struct ReservationInput {
    pub reservation_token: String,
    pub tenant_id: String,
    pub user_id: String,
    pub seat_id: String,
    pub entity_id: String,
    pub seat_number: i64,
    pub price: i64,
    pub expires_at: String,
    pub created: String,
    pub updated: String,
}

impl ReservationInput {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        reservation_token: String,
        tenant_id: String,
        user_id: String,
        seat_id: String,
        entity_id: String,
        seat_number: i64,
        price: i64,
        expires_at: String,
        created: String,
        updated: String,
    ) -> ReservationInput {
        ReservationInput {
            reservation_token, tenant_id, user_id, seat_id, entity_id, seat_number,
            price, expires_at, created, updated,
        }
    }
}

// ---------------------------------------------------------------------------
// bookings:
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Booking {
    pub id: i64,
    pub booking_id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub seat_id: String,
    pub reservation_token: String,
    pub payment_status: String,
    pub payment_reference: String,
    pub amount: i64,
    pub currency: String,
    pub booking_date: String,
    pub created: String,
    pub updated: String,
}

// ---------------------------------------------------------------------------
// orders:
// ---------------------------------------------------------------------------
#[allow(dead_code)]
#[derive(Debug, Clone, FromRow)]
pub struct Order {
    pub id: i64,
    pub order_id: String,
    pub reservation_token: String,
    pub tenant_id: String,
    pub user_id: String,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    pub created: String,
    pub updated: String,
}
