//! Read-only JSON HTTP status API.
//!
//! Exposes what the background currently holds: the UI state snapshot, the
//! badge, the live sessions and single transactions. Nothing here mutates
//! the wallet; approvals only ever come from trusted sessions.
//!
//! Binds to loopback by default. The UI state includes account addresses
//! and pending requests, so do not expose it beyond the local machine.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::controller::{Controller, UiState};
use crate::session::{SessionInfo, SessionRegistry};
use crate::transaction::{TransactionMeta, TxId};

/// Shared RPC state.
#[derive(Clone)]
pub struct RpcState {
    pub controller: Arc<Controller>,
    pub sessions: Arc<SessionRegistry>,
}

/// Build the RPC router.
pub fn router(rpc_state: RpcState) -> Router {
    Router::new()
        .route("/state", get(get_state))
        .route("/badge", get(get_badge))
        .route("/sessions", get(get_sessions))
        .route("/tx/{id}", get(get_tx))
        .with_state(rpc_state)
}

/// Serve until `cancel` fires.
pub async fn serve(
    addr: SocketAddr,
    rpc_state: RpcState,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(rpc_state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Status API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

// ── GET /state ──

async fn get_state(State(state): State<RpcState>) -> Json<UiState> {
    Json(state.controller.ui_state().await)
}

// ── GET /badge ──

#[derive(Serialize)]
struct BadgeResponse {
    count: usize,
    label: String,
    #[serde(flatten)]
    counts: crate::badge::BadgeCounts,
}

async fn get_badge(State(state): State<RpcState>) -> Json<BadgeResponse> {
    let counts = state.controller.badge_counts().await;
    Json(BadgeResponse {
        count: counts.total(),
        label: counts.label(),
        counts,
    })
}

// ── GET /sessions ──

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionsResponse {
    is_client_open: bool,
    sessions: Vec<SessionInfo>,
}

async fn get_sessions(State(state): State<RpcState>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        is_client_open: state.sessions.is_client_open(),
        sessions: state.sessions.sessions(),
    })
}

// ── GET /tx/{id} ──

async fn get_tx(
    State(state): State<RpcState>,
    Path(id): Path<String>,
) -> Result<Json<TransactionMeta>, (StatusCode, String)> {
    let id: TxId = id
        .parse()
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid id: {}", e)))?;
    state
        .controller
        .transaction(id)
        .await
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, "transaction not found".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Request, StatusCode as HttpStatus};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::controller::testing::{harness, Harness};
    use crate::transaction::TxParams;

    fn test_rpc_state() -> (RpcState, Harness) {
        let h = harness();
        let state = RpcState {
            controller: h.controller.clone(),
            sessions: Arc::new(SessionRegistry::new()),
        };
        (state, h)
    }

    async fn get(app: &axum::Router, path: &str) -> (HttpStatus, Vec<u8>) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(path)
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    async fn get_json(app: &axum::Router, path: &str) -> (HttpStatus, serde_json::Value) {
        let (status, body) = get(app, path).await;
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or_else(|e| {
            panic!(
                "JSON parse error: {} (status={}, body={:?})",
                e,
                status,
                String::from_utf8_lossy(&body)
            )
        });
        (status, json)
    }

    #[tokio::test]
    async fn get_state_returns_json() {
        let (state, h) = test_rpc_state();
        let app = router(state);
        let (status, json) = get_json(&app, "/state").await;
        assert_eq!(status, HttpStatus::OK);
        assert_eq!(json["selectedAddress"], h.account);
        assert_eq!(json["unapprovedMsgCount"], 0);
        assert_eq!(json["isClientOpen"], false);
    }

    #[tokio::test]
    async fn badge_counts_pending_transactions() {
        let (state, h) = test_rpc_state();
        let app = router(state);
        let (_, json) = get_json(&app, "/badge").await;
        assert_eq!(json["count"], 0);
        assert_eq!(json["label"], "");

        let params = TxParams {
            from: h.account.clone(),
            to: Some("0x6b175474e89094c44da98b954eedeac495271d0f".into()),
            ..Default::default()
        };
        h.controller
            .submit_transaction_request(params, "https://dapp.example")
            .await
            .unwrap();
        let (status, json) = get_json(&app, "/badge").await;
        assert_eq!(status, HttpStatus::OK);
        assert_eq!(json["count"], 1);
        assert_eq!(json["label"], "1");
        assert_eq!(json["unapprovedTxs"], 1);
    }

    #[tokio::test]
    async fn sessions_empty() {
        let (state, _h) = test_rpc_state();
        let app = router(state);
        let (status, json) = get_json(&app, "/sessions").await;
        assert_eq!(status, HttpStatus::OK);
        assert_eq!(json["isClientOpen"], false);
        assert_eq!(json["sessions"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn get_tx_found_and_missing() {
        let (state, h) = test_rpc_state();
        let app = router(state);
        let params = TxParams {
            from: h.account.clone(),
            to: Some("0x6b175474e89094c44da98b954eedeac495271d0f".into()),
            ..Default::default()
        };
        let id = h
            .controller
            .submit_transaction_request(params, "https://dapp.example")
            .await
            .unwrap();
        let (status, json) = get_json(&app, &format!("/tx/{}", id)).await;
        assert_eq!(status, HttpStatus::OK);
        assert_eq!(json["status"], "unapproved");
        assert_eq!(json["txParams"]["gas"], "0x5208");

        let (status, _) = get(&app, "/tx/1").await;
        assert_eq!(status, HttpStatus::NOT_FOUND);
        let (status, _) = get(&app, "/tx/abc").await;
        assert_eq!(status, HttpStatus::BAD_REQUEST);
    }
}
