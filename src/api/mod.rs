//! HTTP surface — Axum server for outcome queries and settings.
//!
//! Read-only outcome/cycle queries plus the one mutation point the
//! external settings layer uses to update a user's trade profile.
//! CORS enabled for local development. The server is a background
//! task; it never blocks the engine.

pub mod routes;

use anyhow::Result;
use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, put},
    Router,
};
use tower_http::cors::CorsLayer;
use tracing::info;

use routes::AppState;

/// Start the API web server.
///
/// This spawns a background task — it doesn't block.
pub fn spawn_api(state: AppState, port: u16) -> Result<()> {
    let app = build_router(state);

    tokio::spawn(async move {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        info!(port, "API server starting on http://localhost:{port}");

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .expect("Failed to bind API port");

        axum::serve(listener, app).await.expect("API server error");
    });

    Ok(())
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin("*".parse::<HeaderValue>().unwrap())
        .allow_methods([Method::GET, Method::PUT])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/api/status", get(routes::get_status))
        .route("/api/cycles", get(routes::get_cycles))
        .route("/api/cycles/:id/outcomes", get(routes::get_cycle_outcomes))
        .route("/api/users/:id/outcomes", get(routes::get_user_outcomes))
        .route("/api/users/:id/settings", put(routes::put_user_settings))
        .route("/health", get(routes::health))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::TradeLedger;
    use crate::types::{TradeAction, TradeOutcome, TradingCycle, UserTradeProfile};
    use crate::users::SqliteUserDirectory;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use super::routes::ApiState;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn test_state() -> AppState {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let ledger = TradeLedger::new(pool.clone());
        ledger.migrate().await.unwrap();
        let directory = SqliteUserDirectory::new(pool);
        directory.migrate().await.unwrap();
        Arc::new(ApiState::new(Arc::new(ledger), Arc::new(directory)))
    }

    async fn seed_user(state: &AppState) -> i64 {
        let mut profile = UserTradeProfile::sample(0, 10);
        profile.encrypted_api_key = "enc-key".to_string();
        profile.encrypted_api_secret = "enc-secret".to_string();
        state.directory.insert_user(&profile).await.unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = build_router(test_state().await);
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let app = build_router(test_state().await);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["cycles_run"].as_u64().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cycle_outcomes_endpoint() {
        let state = test_state().await;
        let cycle = TradingCycle::new("BTCUSDT", "1", Utc::now());
        state.ledger.open_cycle(&cycle).await.unwrap();
        let outcome = TradeOutcome::pending(cycle.id, 1, None).succeeded(
            TradeAction::Buy,
            5,
            "ord-1".into(),
            Utc::now(),
        );
        state.ledger.record(&outcome).await.unwrap();

        let app = build_router(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/cycles/{}/outcomes", cycle.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        let json: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
        assert_eq!(json.len(), 1);
        assert_eq!(json[0]["leverage_used"].as_u64().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_cycle_outcomes_rejects_bad_id() {
        let app = build_router(test_state().await);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/cycles/not-a-uuid/outcomes")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_put_settings_round_trip() {
        let state = test_state().await;
        let user_id = seed_user(&state).await;

        let app = build_router(Arc::clone(&state));
        let resp = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri(format!("/api/users/{user_id}/settings"))
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"max_leverage": 3, "risk_level": "low", "custom_prompt": "watch volume"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let profile = state.directory.get_profile(user_id).await.unwrap().unwrap();
        assert_eq!(profile.max_leverage, 3);
        assert_eq!(profile.custom_prompt.as_deref(), Some("watch volume"));
    }

    #[tokio::test]
    async fn test_put_settings_unknown_user() {
        let app = build_router(test_state().await);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/api/users/999/settings")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"max_leverage": 3}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_user_outcomes_endpoint() {
        let state = test_state().await;
        let cycle = TradingCycle::new("BTCUSDT", "1", Utc::now());
        let outcome = TradeOutcome::pending(cycle.id, 42, None).held(Utc::now());
        state.ledger.record(&outcome).await.unwrap();

        let app = build_router(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/users/42/outcomes?limit=10")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        let json: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
        assert_eq!(json.len(), 1);
        assert_eq!(json[0]["action_applied"].as_str().unwrap(), "hold");
    }
}
