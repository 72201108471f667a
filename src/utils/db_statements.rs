// This file contains all SQL statements issued by the SBS server.
#![forbid(unsafe_code)]

// ========================= tenants table =========================
pub const SELECT_TENANT_BY_ID: &str = concat!(
    "SELECT id, tenant_id, secret_hash, domain, allowed_origins, enabled, created, updated ",
    "FROM tenants WHERE tenant_id = ?",
);

pub const INSERT_TENANT: &str = concat!(
    "INSERT OR IGNORE INTO tenants (tenant_id, secret_hash, domain, allowed_origins, enabled, created, updated) ",
    "VALUES (?, ?, ?, ?, ?, ?, ?)",
);

// ========================= users table ===========================
pub const SELECT_USER_BY_ID: &str = concat!(
    "SELECT id, user_id, email, name, enabled, created, updated ",
    "FROM users WHERE user_id = ?",
);

pub const INSERT_USER: &str = concat!(
    "INSERT OR IGNORE INTO users (user_id, email, name, enabled, created, updated) ",
    "VALUES (?, ?, ?, ?, ?, ?)",
);

// ========================= seats table ===========================
pub const SELECT_SEAT_BY_SEAT_ID: &str = concat!(
    "SELECT id, seat_id, tenant_id, entity_id, seat_number, price, metadata, status, ",
    "booked_by, booking_ref, created, updated ",
    "FROM seats WHERE seat_id = ?",
);

// The optional price bounds bind twice each: NULL disables the bound.
pub const LIST_AVAILABLE_SEATS: &str = concat!(
    "SELECT id, seat_id, tenant_id, entity_id, seat_number, price, metadata, status, ",
    "booked_by, booking_ref, created, updated ",
    "FROM seats WHERE tenant_id = ? AND entity_id = ? AND status = 'AVAILABLE' ",
    "AND (? IS NULL OR price >= ?) AND (? IS NULL OR price <= ?) ",
    "ORDER BY seat_number",
);

pub const INSERT_SEAT: &str = concat!(
    "INSERT OR IGNORE INTO seats (seat_id, tenant_id, entity_id, seat_number, price, metadata, ",
    "status, created, updated) ",
    "VALUES (?, ?, ?, ?, ?, ?, 'AVAILABLE', ?, ?)",
);

// Guarded transition: only an AVAILABLE seat can become BOOKED.
pub const UPDATE_SEAT_BOOKED: &str = concat!(
    "UPDATE seats SET status = 'BOOKED', booked_by = ?, booking_ref = ?, updated = ? ",
    "WHERE seat_id = ? AND status = 'AVAILABLE'",
);

// ========================= reservations table ====================
pub const INSERT_RESERVATION: &str = concat!(
    "INSERT INTO reservations (reservation_token, tenant_id, user_id, seat_id, entity_id, ",
    "seat_number, price, status, expires_at, created, updated) ",
    "VALUES (?, ?, ?, ?, ?, ?, ?, 'ACTIVE', ?, ?, ?)",
);

pub const SELECT_RESERVATION_BY_TOKEN: &str = concat!(
    "SELECT id, reservation_token, tenant_id, user_id, seat_id, entity_id, seat_number, ",
    "price, status, expires_at, created, updated ",
    "FROM reservations WHERE reservation_token = ?",
);

// Guarded transition used as the lifecycle compare-and-swap: the update
// succeeds only when the row is still in the expected prior status.
pub const UPDATE_RESERVATION_STATUS_GUARDED: &str = concat!(
    "UPDATE reservations SET status = ?, updated = ? ",
    "WHERE reservation_token = ? AND status = ?",
);

// Janitor sweep over stale ACTIVE rows.
pub const EXPIRE_STALE_RESERVATIONS: &str = concat!(
    "UPDATE reservations SET status = 'EXPIRED', updated = ? ",
    "WHERE status = 'ACTIVE' AND expires_at < ?",
);

// Same sweep scoped to one seat, run before a new reservation insert so the
// one-ACTIVE-per-seat index admits the new row.
pub const EXPIRE_STALE_SEAT_RESERVATIONS: &str = concat!(
    "UPDATE reservations SET status = 'EXPIRED', updated = ? ",
    "WHERE seat_id = ? AND status = 'ACTIVE' AND expires_at < ?",
);

// ========================= bookings table ========================
pub const INSERT_BOOKING: &str = concat!(
    "INSERT INTO bookings (booking_id, tenant_id, user_id, seat_id, reservation_token, ",
    "payment_status, payment_reference, amount, currency, booking_date, created, updated) ",
    "VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
);

pub const SELECT_BOOKING_BY_TOKEN: &str = concat!(
    "SELECT id, booking_id, tenant_id, user_id, seat_id, reservation_token, payment_status, ",
    "payment_reference, amount, currency, booking_date, created, updated ",
    "FROM bookings WHERE reservation_token = ?",
);

pub const LIST_USER_BOOKINGS: &str = concat!(
    "SELECT id, booking_id, tenant_id, user_id, seat_id, reservation_token, payment_status, ",
    "payment_reference, amount, currency, booking_date, created, updated ",
    "FROM bookings WHERE tenant_id = ? AND user_id = ? ",
    "ORDER BY created DESC, id DESC LIMIT ? OFFSET ?",
);

pub const COUNT_USER_BOOKINGS: &str =
    "SELECT COUNT(*) FROM bookings WHERE tenant_id = ? AND user_id = ?";

// ========================= orders table ==========================
pub const INSERT_ORDER: &str = concat!(
    "INSERT INTO orders (order_id, reservation_token, tenant_id, user_id, amount, currency, ",
    "status, created, updated) ",
    "VALUES (?, ?, ?, ?, ?, ?, 'CREATED', ?, ?)",
);

pub const SELECT_ORDER_BY_TOKEN: &str = concat!(
    "SELECT id, order_id, reservation_token, tenant_id, user_id, amount, currency, status, ",
    "created, updated ",
    "FROM orders WHERE reservation_token = ?",
);
