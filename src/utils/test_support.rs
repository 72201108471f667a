#![forbid(unsafe_code)]
// Shared fixtures for the unit-test modules: an in-memory runtime context
// with migrated schema, seeded tenants/users/seats and the in-process lock
// store.  Compiled only for tests.

use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;

use crate::utils::authz::hash_tenant_secret;
use crate::utils::config::{Config, Parms, RuntimeCtx};
use crate::utils::db;
use crate::utils::db_init::run_migrations;
use crate::utils::db_types::SeatInput;
use crate::utils::locks::MemoryLockStore;
use crate::utils::payments::PaymentVerifier;
use crate::utils::sbs_utils::{timestamp_utc, timestamp_utc_to_str};

pub const TEST_TOKEN_SECRET: &str = "test-token-secret";
pub const TEST_GATEWAY_SECRET: &str = "gateway-secret";

// Minimum bcrypt cost: these hashes protect nothing.
const TEST_HASH_COST: u32 = 4;

// ---------------------------------------------------------------------------
// test_ctx:
// ---------------------------------------------------------------------------
pub async fn test_ctx() -> Arc<RuntimeCtx> {
    test_ctx_with_ttl(120).await
}

// ---------------------------------------------------------------------------
// test_ctx_with_ttl:
// ---------------------------------------------------------------------------
pub async fn test_ctx_with_ttl(lock_ttl_seconds: u64) -> Arc<RuntimeCtx> {
    let mut config = Config::new();
    config.lock_ttl_seconds = lock_ttl_seconds;
    config.user_token_secret = TEST_TOKEN_SECRET.to_string();
    config.tenant_secret_hash_cost = TEST_HASH_COST;
    config.payment.shared_secret = TEST_GATEWAY_SECRET.to_string();

    // A single pinned connection so the in-memory database survives the
    // whole test and every task sees the same data.
    let db = SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory database");
    run_migrations(&db).await.expect("migrations");

    let verifier = PaymentVerifier::new(&config.payment);
    let ctx = Arc::new(RuntimeCtx {
        parms: Parms { config_file: String::new(), config },
        db,
        locks: Arc::new(MemoryLockStore::new()),
        verifier,
    });
    seed(&ctx).await;
    ctx
}

// ---------------------------------------------------------------------------
// seed:
// ---------------------------------------------------------------------------
async fn seed(ctx: &RuntimeCtx) {
    let acme_hash = hash_tenant_secret("acme-secret", TEST_HASH_COST).unwrap();
    let beta_hash = hash_tenant_secret("beta-secret", TEST_HASH_COST).unwrap();
    let strict_hash = hash_tenant_secret("strict-secret", TEST_HASH_COST).unwrap();
    let sleepy_hash = hash_tenant_secret("sleepy-secret", TEST_HASH_COST).unwrap();

    db::insert_tenant(&ctx.db, "acme", &acme_hash, "events", "[]").await.unwrap();
    db::insert_tenant(&ctx.db, "beta", &beta_hash, "transit", "[]").await.unwrap();
    db::insert_tenant(&ctx.db, "strict", &strict_hash, "events", "[\"example.com\"]")
        .await
        .unwrap();
    db::insert_tenant(&ctx.db, "sleepy", &sleepy_hash, "events", "[]").await.unwrap();

    // The sleepy tenant is disabled after insert; the seeding statement
    // always writes enabled rows.
    let now_str = timestamp_utc_to_str(timestamp_utc());
    sqlx::query("UPDATE tenants SET enabled = 0, updated = ? WHERE tenant_id = 'sleepy'")
        .bind(&now_str)
        .execute(&ctx.db)
        .await
        .unwrap();

    db::insert_user(&ctx.db, "user-1", "alice@example.com", "Alice").await.unwrap();
    db::insert_user(&ctx.db, "user-2", "bob@example.com", "Bob").await.unwrap();
    db::insert_user(&ctx.db, "user-b", "bea@example.com", "Bea").await.unwrap();

    // Eight acme seats in one entity, one beta seat elsewhere.
    for n in 1..=8 {
        db::insert_seat(
            &ctx.db,
            SeatInput::new(
                format!("S{}", n),
                "acme".to_string(),
                "EVT-1".to_string(),
                n,
                100,
                "{}".to_string(),
            ),
        )
        .await
        .unwrap();
    }
    db::insert_seat(
        &ctx.db,
        SeatInput::new(
            "B1".to_string(),
            "beta".to_string(),
            "EVT-9".to_string(),
            1,
            50,
            "{}".to_string(),
        ),
    )
    .await
    .unwrap();
}
