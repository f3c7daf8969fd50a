//! WebSocket signaling transport built on `tokio-tungstenite`.
//!
//! Reconnection is left to the host: when the socket drops, `is_open()` turns
//! false, outbound signaling is dropped by the core, and the host may dial a
//! fresh transport.

use crate::net::SignalingTransport;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

/// An event produced by the signaling socket.
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// The socket is connected.
    Connected,
    /// A text frame arrived.
    FrameReceived(String),
    /// The connection was lost.
    Disconnected,
}

pub struct WebSocketSignalingTransport {
    ws_sink: Mutex<Option<WsSink>>,
    is_connected: Arc<AtomicBool>,
}

impl WebSocketSignalingTransport {
    /// Dials `url` and spawns the read pump.
    pub async fn connect(
        url: &str,
    ) -> Result<(Arc<Self>, mpsc::Receiver<SignalingEvent>), anyhow::Error> {
        info!("Dialing signaling server {url}");
        let (client, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket connect failed: {}", e))?;

        let (sink, stream) = client.split();
        let (event_tx, event_rx) = mpsc::channel(100);
        let is_connected = Arc::new(AtomicBool::new(true));

        let transport = Arc::new(Self {
            ws_sink: Mutex::new(Some(sink)),
            is_connected: is_connected.clone(),
        });

        tokio::task::spawn(read_pump(stream, event_tx.clone(), is_connected));
        let _ = event_tx.send(SignalingEvent::Connected).await;

        Ok((transport, event_rx))
    }

    pub async fn disconnect(&self) {
        if self.is_connected.swap(false, Ordering::SeqCst) {
            if let Some(mut sink) = self.ws_sink.lock().await.take()
                && let Err(e) = sink.close().await
            {
                debug!("WebSocket close error: {e}");
            }
        }
    }
}

#[async_trait]
impl SignalingTransport for WebSocketSignalingTransport {
    fn is_open(&self) -> bool {
        self.is_connected.load(Ordering::SeqCst)
    }

    async fn send(&self, frame: String) -> Result<(), anyhow::Error> {
        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Socket is closed"))?;

        debug!("--> Sending signaling frame: {} bytes", frame.len());
        sink.send(Message::text(frame))
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket send error: {}", e))?;
        Ok(())
    }
}

async fn read_pump(
    mut stream: WsStream,
    event_tx: mpsc::Sender<SignalingEvent>,
    is_connected: Arc<AtomicBool>,
) {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                trace!("<-- Received signaling frame: {} bytes", text.len());
                if event_tx
                    .send(SignalingEvent::FrameReceived(text.as_str().to_owned()))
                    .await
                    .is_err()
                {
                    warn!("Event receiver dropped, closing read pump");
                    break;
                }
            }
            Some(Ok(Message::Close(_))) => {
                trace!("Received close frame");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!("Error reading from websocket: {e}");
                break;
            }
            None => {
                trace!("Websocket stream ended");
                break;
            }
        }
    }

    is_connected.store(false, Ordering::SeqCst);
    let _ = event_tx.send(SignalingEvent::Disconnected).await;
}
