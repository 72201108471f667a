#![forbid(unsafe_code)]

use log::info;
use poem::{listener::TcpListener, Route};
use poem_openapi::OpenApiService;
use std::sync::Arc;
use std::time::Duration;

// SBS Utilities
use crate::utils::config::{init_log, RuntimeCtx};
use crate::utils::db;
use crate::utils::engine;
use crate::utils::errors::Errors;
use crate::v1::sbs::bookings_list::ListBookingsApi;
use crate::v1::sbs::orders_create::CreateOrderApi;
use crate::v1::sbs::reservations_confirm::ConfirmReservationApi;
use crate::v1::sbs::reservations_create::ReserveSeatApi;
use crate::v1::sbs::reservations_release::ReleaseReservationApi;
use crate::v1::sbs::seats_list::ListSeatsApi;
use crate::v1::sbs::version::VersionApi;

// Modules
mod utils;
mod v1;

// ***************************************************************************
//                                Constants
// ***************************************************************************
const SERVER_NAME: &str = "SbsServer"; // for poem logging

// ---------------------------------------------------------------------------
// main:
// ---------------------------------------------------------------------------
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    // --------------- Initialize SBS -----------------
    // Announce ourselves.
    println!("Starting sbs_server!");

    // Configure our log.
    init_log();

    // Read configuration and connect the durable and lock stores.  The
    // server cannot run without them, so failures here abort startup.
    let ctx = RuntimeCtx::init().await.expect("FAILED to initialize the runtime context.");
    sbs_init(&ctx).await;

    // Reconcile stale ACTIVE reservations in the background.
    tokio::spawn(engine::janitor_loop(ctx.clone()));

    // --------------- Main Loop Set Up ---------------
    // Assign base URL.
    let sbs_url = format!(
        "http://{}:{}{}",
        ctx.parms.config.http_addr, ctx.parms.config.http_port, "/v1"
    );

    // Create a tuple with all the API endpoint structs, each holding its
    // own handle to the runtime context.
    let endpoints = (
        ListSeatsApi { ctx: ctx.clone() },
        ReserveSeatApi { ctx: ctx.clone() },
        CreateOrderApi { ctx: ctx.clone() },
        ConfirmReservationApi { ctx: ctx.clone() },
        ReleaseReservationApi { ctx: ctx.clone() },
        ListBookingsApi { ctx: ctx.clone() },
        VersionApi,
    );
    let api_service = OpenApiService::new(
        endpoints,
        "SBS Server",
        option_env!("CARGO_PKG_VERSION").unwrap_or("unknown"),
    )
    .server(sbs_url);

    // Allow the generated openapi specs to be retrieved from the server.
    let spec = api_service.spec_endpoint();
    let spec_yaml = api_service.spec_endpoint_yaml();

    // Create the routes.
    let addr = format!("{}:{}", ctx.parms.config.http_addr, ctx.parms.config.http_port);
    let ui = api_service.swagger_ui();
    let app = Route::new()
        .nest("/v1", api_service)
        .nest("/", ui)
        .at("/spec", spec)
        .at("/spec_yaml", spec_yaml);

    // ------------------ Main Loop -------------------
    // On shutdown: stop accepting, drain in-flight handlers within the
    // grace period, then close the adapters.
    let grace = Duration::from_secs(ctx.parms.config.shutdown_grace_seconds);
    let result = poem::Server::new(TcpListener::bind(addr))
        .name(SERVER_NAME)
        .run_with_graceful_shutdown(app, shutdown_signal(), Some(grace))
        .await;

    ctx.db.close().await;
    info!("sbs_server stopped.");
    result
}

// ***************************************************************************
//                             Private Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// sbs_init:
// ---------------------------------------------------------------------------
/** Initialize all subsystems and data structures other than those needed
 * to configure the main loop processor.
 */
async fn sbs_init(ctx: &Arc<RuntimeCtx>) {
    // Log the input parameters.
    info!("{}", Errors::InputParms(format!("{:#?}", ctx.parms)));

    // Log build info.
    print_version_info();

    // Optional development data.
    db::check_dev_seed(ctx).await;
}

// ---------------------------------------------------------------------------
// print_version_info:
// ---------------------------------------------------------------------------
fn print_version_info() {
    info!(
        "{}",
        format!(
            "\n*** Running SBS={}",
            option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
        )
    );
}

// ---------------------------------------------------------------------------
// shutdown_signal:
// ---------------------------------------------------------------------------
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::warn!("Unable to listen for the shutdown signal: {}", e);
        return;
    }
    info!("Shutdown signal received; draining in-flight requests.");
}
