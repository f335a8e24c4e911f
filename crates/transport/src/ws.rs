//! WebSocket connector
//!
//! Splits the socket into a writer task fed by an mpsc channel and a reader
//! task that forwards frames as [`TransportEvent`]s. A read error or a stream
//! that ends without a close frame is reported as close code 1006.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::connection::{Connection, Connector, TransportEvent, ABNORMAL_CLOSE};
use crate::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code used when a close frame carries no status
const NO_STATUS: u16 = 1005;

/// tokio-tungstenite backed [`Connector`]
#[derive(Debug, Clone)]
pub struct WsConnector {
    outbound_buffer: usize,
    connect_timeout: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self {
            outbound_buffer: 64,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl WsConnector {
    pub fn new(outbound_buffer: usize, connect_timeout: Duration) -> Self {
        Self {
            outbound_buffer: outbound_buffer.max(1),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, endpoint: &str) -> Result<Connection, TransportError> {
        let (stream, _response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(endpoint))
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (sink, stream) = stream.split();
        let (out_tx, out_rx) = mpsc::channel::<String>(self.outbound_buffer);
        let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(256);

        tokio::spawn(outbound_loop(out_rx, sink));
        tokio::spawn(inbound_loop(stream, in_tx));

        Ok(Connection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Writes queued frames until the manager drops its sender, then closes
async fn outbound_loop(mut rx: mpsc::Receiver<String>, mut sink: SplitSink<WsStream, Message>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = sink.send(Message::Text(frame.into())).await {
            tracing::warn!(error = %e, "WebSocket write failed");
            return;
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
    tracing::debug!("Outbound loop terminated");
}

async fn inbound_loop(mut stream: SplitStream<WsStream>, tx: mpsc::Sender<TransportEvent>) {
    while let Some(frame) = stream.next().await {
        let event = match frame {
            Ok(Message::Text(text)) => TransportEvent::Text(text.as_str().to_owned()),
            Ok(Message::Binary(data)) => TransportEvent::Binary(data.to_vec()),
            Ok(Message::Close(frame)) => {
                let code = frame.map(|f| u16::from(f.code)).unwrap_or(NO_STATUS);
                let _ = tx.send(TransportEvent::Closed { code }).await;
                return;
            }
            // ping/pong control frames are answered by tungstenite
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
            Err(e) => {
                let _ = tx.send(TransportEvent::Error(e.to_string())).await;
                let _ = tx
                    .send(TransportEvent::Closed {
                        code: ABNORMAL_CLOSE,
                    })
                    .await;
                return;
            }
        };

        if tx.send(event).await.is_err() {
            // manager moved on to another connection
            return;
        }
    }

    let _ = tx
        .send(TransportEvent::Closed {
            code: ABNORMAL_CLOSE,
        })
        .await;
}
