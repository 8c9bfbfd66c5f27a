//! The duplex call channel.
//!
//! [`CallTransport`] is the seam between the session state machine and the network;
//! [`WsTransport`] implements it over a WebSocket keyed by the call id.

use crate::error::{VoiceError, VoiceResult};
use crate::protocol::WireFrame;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

#[async_trait(?Send)]
pub trait CallTransport {
    /// Send one finished utterance as a single binary frame.
    async fn send_utterance(&mut self, payload: Vec<u8>) -> VoiceResult<()>;

    /// Next text or binary frame from the peer, in arrival order. `None` once the
    /// channel is closed. Must be cancel-safe: the session polls it inside `select!`.
    async fn next_frame(&mut self) -> Option<VoiceResult<WireFrame>>;

    /// Close the channel. Idempotent.
    async fn close(&mut self);
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsTransport {
    stream: Option<WsStream>,
}

impl WsTransport {
    /// Open the stream channel at `url` (`ws://…/api/call/{id}/stream`).
    pub async fn connect(url: &str) -> VoiceResult<Self> {
        let (stream, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| VoiceError::Channel(format!("connect {}: {}", url, e)))?;
        info!(target: "carttalk::call", status = %response.status(), "stream channel open");
        Ok(Self {
            stream: Some(stream),
        })
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

#[async_trait(?Send)]
impl CallTransport for WsTransport {
    async fn send_utterance(&mut self, payload: Vec<u8>) -> VoiceResult<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| VoiceError::Channel("channel closed".to_string()))?;
        stream.send(Message::Binary(payload)).await?;
        Ok(())
    }

    async fn next_frame(&mut self) -> Option<VoiceResult<WireFrame>> {
        let stream = self.stream.as_mut()?;
        loop {
            match stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(WireFrame::Text(text))),
                Ok(Message::Binary(bytes)) => return Some(Ok(WireFrame::Binary(bytes))),
                Ok(Message::Close(frame)) => {
                    debug!("peer closed the channel: {:?}", frame);
                    return None;
                }
                // pings are answered by tungstenite on the next read/write
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.close(None).await {
                warn!("closing stream channel: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn frames_flow_both_ways_until_peer_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let peer = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let utterance = ws.next().await.unwrap().unwrap();
            ws.send(Message::Text(
                r#"{"type":"transcript","role":"user","text":"hi"}"#.into(),
            ))
            .await
            .unwrap();
            ws.send(Message::Ping(vec![1])).await.unwrap();
            ws.send(Message::Binary(Vec::new())).await.unwrap();
            ws.close(None).await.unwrap();
            utterance
        });

        let mut transport = WsTransport::connect(&format!("ws://{}", addr)).await.unwrap();
        assert!(transport.is_open());
        transport.send_utterance(vec![1, 2, 3]).await.unwrap();

        assert_eq!(
            transport.next_frame().await.unwrap().unwrap(),
            WireFrame::Text(r#"{"type":"transcript","role":"user","text":"hi"}"#.into())
        );
        // the ping is skipped, the empty binary frame is not
        assert_eq!(
            transport.next_frame().await.unwrap().unwrap(),
            WireFrame::Binary(Vec::new())
        );
        assert!(transport.next_frame().await.is_none());

        transport.close().await;
        transport.close().await;
        assert!(!transport.is_open());
        assert!(matches!(
            transport.send_utterance(vec![4]).await,
            Err(VoiceError::Channel(_))
        ));

        assert_eq!(peer.await.unwrap(), Message::Binary(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn connect_failure_is_channel_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = WsTransport::connect(&format!("ws://{}", addr)).await.err().unwrap();
        assert!(matches!(err, VoiceError::Channel(_)));
    }
}
