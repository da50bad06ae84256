//! Documentation of the crowdfunding contribution and settlement service.
//!
//!
//!
//! # General Infrastructure
//! - Users reach the public reverse proxy, which authenticates the session
//! - The proxy forwards the caller as `x-user-id` / `x-user-role` headers, see [`user`]
//! - This service talks to Redis for state and to the payment gateway for orders
//! - The hosted checkout runs entirely between the payer and the gateway
//!
//!
//!
//! # Contribution Flow
//!
//! 1. `POST /campaigns/{id}/contributions/order` with an amount in major units
//! 2. We check the campaign is approved, open a gateway order and record it as pending
//! 3. The payer completes checkout with the gateway, which returns a signed confirmation
//! 4. `POST /campaigns/{id}/contributions/confirm` with the order id, payment id and signature
//! 5. We verify the signature, mark the record succeeded and apply it to the campaign ledger
//!
//! Replayed confirmations are answered with the original success, see [`settlement`].
//!
//!
//!
//! # Notes
//!
//! ## Amounts
//! Amounts cross the API in major units (`25.50`) and live everywhere else as integer minor
//! units. The conversion rounds to the nearest minor unit.
//!
//! ## Orphans
//! Abandoned checkouts leave pending records. A background task fails them once they are
//! older than `PENDING_TTL_SECS`. The `reaper` binary does the same on demand.
//!
//! ## Reconciliation
//! Nothing retries a ledger update on its own. Orders that were paid but could not reach the
//! ledger land in a queue moderators read from `GET /contributions/unreconciled`.
//!
//!
//!
//! # Setup
//!
//! View current docs.
//! ```sh
//! cargo doc --open
//! ```
//!
//! Run locally without Redis.
//! ```sh
//! STORAGE=memory RUST_LOG=info cargo run -p crowdfund
//! ```
//!
//! Sign a confirmation by hand.
//! ```sh
//! GATEWAY_KEY_SECRET=... cargo run -p tester -- order_123 pay_456 25.00
//! ```
use std::time::Duration;

use axum::{
    Router,
    http::{HeaderName, Method, header::CONTENT_TYPE},
    routing::{get, post},
};

use signal::{
    ctrl_c,
    unix::{SignalKind, signal},
};
use tokio::{net::TcpListener, signal};
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

pub mod campaign;
pub mod config;
pub mod database;
pub mod error;
pub mod ledger;
pub mod reaper;
pub mod records;
pub mod routes;
pub mod settlement;
pub mod state;
pub mod user;
pub mod utils;

use reaper::spawn_reaper;
use routes::{
    campaign_handler, confirm_handler, contributions_handler, create_campaign_handler,
    order_handler, status_handler, unreconciled_handler,
};
use state::AppState;
use user::{USER_ID_HEADER, USER_ROLE_HEADER};

pub async fn start_server() {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    info!("Initializing state...");
    let state = AppState::new().await;

    info!("Starting orphan reaper...");
    let reaper = spawn_reaper(
        state.records.clone(),
        state.config.pending_ttl,
        state.config.reap_interval,
    );

    info!("Starting server...");

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            CONTENT_TYPE,
            HeaderName::from_static(USER_ID_HEADER),
            HeaderName::from_static(USER_ROLE_HEADER),
        ])
        .max_age(Duration::from_secs(60 * 60));

    let app = Router::new()
        .route("/campaigns", post(create_campaign_handler))
        .route("/campaigns/{id}", get(campaign_handler))
        .route("/campaigns/{id}/status", post(status_handler))
        .route("/campaigns/{id}/contributions", get(contributions_handler))
        .route("/campaigns/{id}/contributions/order", post(order_handler))
        .route("/campaigns/{id}/contributions/confirm", post(confirm_handler))
        .route("/contributions/unreconciled", get(unreconciled_handler))
        .layer(cors)
        .with_state(state.clone());

    let address = format!("0.0.0.0:{}", state.config.port);
    info!("Binding to {address}");

    let listener = TcpListener::bind(&address)
        .await
        .expect("Failed to bind listener");
    info!("Server running on {address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    reaper.abort();
    info!("Server shut down");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        ctrl_c().await.expect("Failed to install Ctrl+C handler");

        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        signal(SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;

        info!("Received terminate signal, shutting down");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
