use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
};
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};

/// One established duplex connection, as text frames.
///
/// The link is closed once `inbound` yields `None`; dropping `outbound`
/// closes the socket from our side.
pub struct WsLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
pub trait WsConnector: Send + Sync {
    async fn connect(&self, url: &str) -> SyncResult<WsLink>;
}

/// Derives the push endpoint from the HTTP base url.
pub fn ws_url(server_url: &str) -> SyncResult<String> {
    let base = server_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(SyncError::Config(
            "server_url must start with http:// or https://".into(),
        ));
    };
    Ok(format!("{ws_base}/ws"))
}

pub struct TungsteniteConnector {
    auth_cookie: Option<String>,
}

impl TungsteniteConnector {
    pub fn new(auth_cookie: Option<String>) -> Self {
        Self { auth_cookie }
    }
}

#[async_trait]
impl WsConnector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> SyncResult<WsLink> {
        let mut request = url.into_client_request()?;
        if let Some(cookie) = &self.auth_cookie {
            let value = HeaderValue::from_str(cookie)
                .map_err(|err| SyncError::Config(format!("auth_cookie: {err}")))?;
            request.headers_mut().insert("cookie", value);
        }
        let (ws_stream, _) = connect_async(request).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    warn!(%err, "websocket send failed");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(%err, "websocket receive failed");
                        break;
                    }
                }
            }
            debug!("websocket reader finished");
        });

        Ok(WsLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
