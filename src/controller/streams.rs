//! Serving one connected session.
//!
//! Each session multiplexes substreams over its port by frame name:
//! `provider` requests from pages, `controller` requests from trusted wallet
//! surfaces, and the state pushes going the other way. Requests are handled
//! on their own tasks so a request waiting for the user never blocks the
//! rest of the session.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::dispatch::{response, RequestOrigin, RpcRequest};
use super::{Controller, ControllerError, ControllerEvent};
use crate::session::{Frame, Port, SessionInfo};

pub const PROVIDER_STREAM: &str = "provider";
pub const CONTROLLER_STREAM: &str = "controller";
pub const PUBLIC_CONFIG_STREAM: &str = "publicConfig";

/// Serve `port` until the remote side disconnects.
pub async fn run_session(controller: Arc<Controller>, info: SessionInfo, mut port: Port) {
    let cancel = CancellationToken::new();
    let pushes = if info.trusted {
        setup_trusted_communication(controller.clone(), port.outbound.clone(), cancel.clone())
    } else {
        setup_untrusted_communication(
            controller.clone(),
            info.origin.clone(),
            port.outbound.clone(),
            cancel.clone(),
        )
    };

    let from = RequestOrigin {
        origin: info.origin.clone(),
        site_title: None,
        tab_id: info.tab_id,
    };
    while let Some(frame) = port.inbound.recv().await {
        let stream = frame.name.clone();
        let request: RpcRequest = match serde_json::from_value(frame.data) {
            Ok(request) => request,
            Err(e) => {
                let reply = response(Value::Null, Err(ControllerError::InvalidParams(e.to_string())));
                let _ = port.outbound.send(Frame::new(&stream, reply)).await;
                continue;
            }
        };
        let trusted = info.trusted;
        match stream.as_str() {
            PROVIDER_STREAM | CONTROLLER_STREAM => {}
            other => {
                tracing::debug!("Session {} sent frame on unknown substream {}", info.id, other);
                continue;
            }
        }

        let controller = controller.clone();
        let outbound = port.outbound.clone();
        let from = from.clone();
        tokio::spawn(async move {
            let id = request.id.clone();
            let result = if stream == CONTROLLER_STREAM {
                if trusted {
                    controller.handle_controller_request(request).await
                } else {
                    Err(ControllerError::Unauthorized(from.origin.clone()))
                }
            } else {
                controller.handle_provider_request(&from, request).await
            };
            if outbound.send(Frame::new(&stream, response(id, result))).await.is_err() {
                tracing::debug!("Session closed before reply on {}", stream);
            }
        });
    }

    cancel.cancel();
    let _ = pushes.await;
    tracing::debug!("Session {} ({}) ended", info.id, info.name);
}

/// Push the full UI state to a wallet surface on every change.
pub fn setup_trusted_communication(
    controller: Arc<Controller>,
    outbound: mpsc::Sender<Frame>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut events = controller.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(ControllerEvent::StateChanged) | Err(RecvError::Lagged(_)) => {}
                    Ok(_) => continue,
                    Err(RecvError::Closed) => return,
                },
                _ = cancel.cancelled() => return,
            }
            let ui = match serde_json::to_value(controller.ui_state().await) {
                Ok(ui) => ui,
                Err(e) => {
                    tracing::error!("Could not serialize UI state: {}", e);
                    continue;
                }
            };
            let update = json!({ "method": "sendUpdate", "params": [ui] });
            if outbound.send(Frame::new(CONTROLLER_STREAM, update)).await.is_err() {
                return;
            }
        }
    })
}

/// Push `publicConfig` to a page: once on connect, then whenever it changes.
pub fn setup_untrusted_communication(
    controller: Arc<Controller>,
    origin: String,
    outbound: mpsc::Sender<Frame>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut events = controller.subscribe();
    tokio::spawn(async move {
        let mut last: Option<Value> = None;
        loop {
            let config = controller.public_config(&origin).await;
            if last.as_ref() != Some(&config) {
                if outbound
                    .send(Frame::new(PUBLIC_CONFIG_STREAM, config.clone()))
                    .await
                    .is_err()
                {
                    return;
                }
                last = Some(config);
            }
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(ControllerEvent::StateChanged) | Err(RecvError::Lagged(_)) => break,
                        Ok(_) => continue,
                        Err(RecvError::Closed) => return,
                    },
                    _ = cancel.cancelled() => return,
                }
            }
        }
    })
}
