//! TCP transport for sessions.
//!
//! Each connection carries length-prefixed JSON frames: a 4-byte
//! little-endian length followed by the payload. The first frame is a
//! `Hello` naming the port and describing the sender; every frame after it
//! is a session `Frame`. Two listeners exist: the internal one, where ports
//! are classified by name, and the external one, where every port is treated
//! as a page.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::constants::MAX_FRAME_BYTES;
use crate::router::SessionRouter;
use crate::session::{Frame, Port, PortSender};

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(String),
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
    #[error("malformed frame: {0}")]
    Codec(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// First frame on every connection.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub name: String,
    #[serde(default)]
    pub sender: PortSender,
    /// Shared UI token, checked for internal names on the internal listener.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Which listener a connection arrived on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerKind {
    Internal,
    External,
}

/// Bound addresses of a running transport.
#[derive(Clone, Copy, Debug)]
pub struct TransportHandle {
    pub internal_addr: SocketAddr,
    pub external_addr: SocketAddr,
}

/// Serialize `msg` as one length-prefixed frame.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, TransportError> {
    let payload = serde_json::to_vec(msg).map_err(|e| TransportError::Codec(e.to_string()))?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(TransportError::FrameTooLarge(payload.len()));
    }
    let len = (payload.len() as u32).to_le_bytes();
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Read one frame. `Ok(None)` on a clean end of stream between frames.
pub async fn read_frame<T: DeserializeOwned>(
    stream: &mut OwnedReadHalf,
) -> Result<Option<T>, TransportError> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(TransportError::Io(e.to_string())),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    serde_json::from_slice(&payload)
        .map(Some)
        .map_err(|e| TransportError::Codec(e.to_string()))
}

pub async fn write_frame<T: Serialize>(
    stream: &mut OwnedWriteHalf,
    msg: &T,
) -> Result<(), TransportError> {
    let bytes = encode_frame(msg)?;
    stream
        .write_all(&bytes)
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    stream
        .flush()
        .await
        .map_err(|e| TransportError::Io(e.to_string()))
}

/// Bind both listeners and accept until `cancel` fires.
pub async fn start(
    router: Arc<SessionRouter>,
    internal_addr: SocketAddr,
    external_addr: SocketAddr,
    ui_token: Option<String>,
    cancel: CancellationToken,
) -> Result<TransportHandle, TransportError> {
    let internal = TcpListener::bind(internal_addr)
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    let external = TcpListener::bind(external_addr)
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    let handle = TransportHandle {
        internal_addr: internal
            .local_addr()
            .map_err(|e| TransportError::Io(e.to_string()))?,
        external_addr: external
            .local_addr()
            .map_err(|e| TransportError::Io(e.to_string()))?,
    };
    tracing::info!(
        "Session transport listening on {} (internal) and {} (external)",
        handle.internal_addr,
        handle.external_addr
    );

    let ui_token = Arc::new(ui_token);
    tokio::spawn(accept_loop(
        internal,
        ListenerKind::Internal,
        router.clone(),
        ui_token.clone(),
        cancel.clone(),
    ));
    tokio::spawn(accept_loop(
        external,
        ListenerKind::External,
        router,
        ui_token,
        cancel,
    ));
    Ok(handle)
}

async fn accept_loop(
    listener: TcpListener,
    kind: ListenerKind,
    router: Arc<SessionRouter>,
    ui_token: Arc<Option<String>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, addr)) => {
                    let router = router.clone();
                    let ui_token = ui_token.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, kind, &router, &ui_token, cancel).await {
                            tracing::debug!(addr = %addr, error = %e, "Session connection failed");
                        }
                    });
                }
                Err(e) => tracing::warn!("Accept failed: {}", e),
            },
            _ = cancel.cancelled() => break,
        }
    }
    tracing::debug!("{:?} listener stopped", kind);
}

async fn handle_connection(
    stream: TcpStream,
    kind: ListenerKind,
    router: &SessionRouter,
    ui_token: &Option<String>,
    cancel: CancellationToken,
) -> Result<(), TransportError> {
    let (mut reader, mut writer) = stream.into_split();
    let hello: Hello = read_frame(&mut reader)
        .await?
        .ok_or_else(|| TransportError::Handshake("closed before hello".into()))?;

    let (port, mut remote) = Port::pair(&hello.name, hello.sender);
    let session = match kind {
        ListenerKind::Internal => {
            // Without a configured token no TCP peer may claim a UI name.
            if router.is_internal(&hello.name)
                && (ui_token.is_none() || hello.token != *ui_token)
            {
                return Err(TransportError::Handshake(format!(
                    "bad UI token for {}",
                    hello.name
                )));
            }
            router.on_connect(port)
        }
        ListenerKind::External => router.connect_external(port),
    };
    if session.is_none() {
        return Ok(());
    }

    let write_task = tokio::spawn(async move {
        while let Some(frame) = remote.rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                tracing::debug!("Session write failed: {}", e);
                break;
            }
        }
    });

    let result = loop {
        tokio::select! {
            frame = read_frame::<Frame>(&mut reader) => match frame {
                Ok(Some(frame)) => {
                    if remote.tx.send(frame).await.is_err() {
                        break Ok(());
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            },
            _ = cancel.cancelled() => break Ok(()),
        }
    };
    drop(remote.tx);
    write_task.abort();
    result
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::config::TransportConfig;
    use crate::controller::testing::harness;
    use crate::session::SessionRegistry;

    async fn transport(
        ui_token: Option<String>,
    ) -> (TransportHandle, Arc<SessionRegistry>, CancellationToken) {
        let h = harness();
        let registry = Arc::new(SessionRegistry::new());
        let router = Arc::new(SessionRouter::new(
            h.controller,
            registry.clone(),
            &TransportConfig::default(),
            None,
        ));
        let cancel = CancellationToken::new();
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let handle = start(router, any, any, ui_token, cancel.clone())
            .await
            .unwrap();
        (handle, registry, cancel)
    }

    async fn connect(addr: SocketAddr, hello: Hello) -> (OwnedReadHalf, OwnedWriteHalf) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        write_frame(&mut writer, &hello).await.unwrap();
        (reader, writer)
    }

    async fn next_frame(reader: &mut OwnedReadHalf, name: &str) -> Frame {
        loop {
            let frame: Frame = tokio::time::timeout(Duration::from_secs(2), read_frame(reader))
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if frame.name == name {
                return frame;
            }
        }
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let big = "x".repeat(MAX_FRAME_BYTES + 1);
        assert!(matches!(
            encode_frame(&big),
            Err(TransportError::FrameTooLarge(_))
        ));
        let small = encode_frame(&json!({"a": 1})).unwrap();
        assert_eq!(u32::from_le_bytes(small[..4].try_into().unwrap()) as usize, small.len() - 4);
    }

    #[tokio::test]
    async fn page_request_over_tcp() {
        let (handle, registry, cancel) = transport(None).await;
        let hello = Hello {
            name: "contentscript".into(),
            sender: PortSender {
                url: Some("https://dapp.example/".into()),
                ..Default::default()
            },
            token: None,
        };
        let (mut reader, mut writer) = connect(handle.external_addr, hello).await;
        let config = next_frame(&mut reader, "publicConfig").await;
        assert_eq!(config.data["networkVersion"], "1256");

        let request = Frame::new("provider", json!({"id": 2, "method": "net_version"}));
        write_frame(&mut writer, &request).await.unwrap();
        let reply = next_frame(&mut reader, "provider").await;
        assert_eq!(reply.data["result"], "1256");
        assert_eq!(registry.sessions().len(), 1);

        drop(writer);
        drop(reader);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.sessions().is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn internal_name_needs_token() {
        let (handle, registry, cancel) = transport(Some("secret".into())).await;
        let hello = Hello {
            name: "popup".into(),
            sender: PortSender::default(),
            token: Some("wrong".into()),
        };
        let (mut reader, _writer) = connect(handle.internal_addr, hello).await;
        let closed: Option<Frame> = tokio::time::timeout(Duration::from_secs(2), read_frame(&mut reader))
            .await
            .unwrap()
            .unwrap();
        assert!(closed.is_none());
        assert!(registry.sessions().is_empty());

        let hello = Hello {
            name: "popup".into(),
            sender: PortSender::default(),
            token: Some("secret".into()),
        };
        let (_reader, _writer) = connect(handle.internal_addr, hello).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.sessions()[0].trusted);
        cancel.cancel();
    }

    #[tokio::test]
    async fn internal_name_refused_without_configured_token() {
        let (handle, registry, cancel) = transport(None).await;
        for token in [None, Some("anything".to_string())] {
            let hello = Hello {
                name: "popup".into(),
                sender: PortSender::default(),
                token,
            };
            let (mut reader, _writer) = connect(handle.internal_addr, hello).await;
            let closed: Option<Frame> =
                tokio::time::timeout(Duration::from_secs(2), read_frame(&mut reader))
                    .await
                    .unwrap()
                    .unwrap();
            assert!(closed.is_none());
        }
        assert!(registry.sessions().is_empty());

        let hello = Hello {
            name: "contentscript".into(),
            sender: PortSender {
                url: Some("https://dapp.example/".into()),
                ..Default::default()
            },
            token: None,
        };
        let (mut reader, _writer) = connect(handle.internal_addr, hello).await;
        next_frame(&mut reader, "publicConfig").await;
        assert!(!registry.sessions()[0].trusted);
        cancel.cancel();
    }

    #[tokio::test]
    async fn deny_listed_connection_is_closed() {
        let (handle, registry, cancel) = transport(None).await;
        let hello = Hello {
            name: "trezor-connect".into(),
            ..Default::default()
        };
        let (mut reader, _writer) = connect(handle.internal_addr, hello).await;
        let closed: Option<Frame> = tokio::time::timeout(Duration::from_secs(2), read_frame(&mut reader))
            .await
            .unwrap()
            .unwrap();
        assert!(closed.is_none());
        assert!(registry.sessions().is_empty());
        cancel.cancel();
    }
}
