//! WebSocket echo channel used by clients to measure application-level RTT.
//!
//! Every message must decode into [`EchoMessage`]. Valid messages are echoed
//! back unchanged; the final one is also written verbatim to the result log.

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::net::IpAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::export::{EchoRecord, JsonLineLog};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EchoMessage {
    /// One latency sample in flight
    #[serde(rename = "ws-latency")]
    Latency { seq: u32, sent_at: f64 },
    /// Client's summary once sampling is done
    #[serde(rename = "ws-final")]
    Final {
        #[serde(rename = "UUID")]
        uuid: String,
        latencies: Vec<f64>,
    },
}

impl EchoMessage {
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Check an already parsed message, leaving the raw value untouched
    pub fn from_value(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(value)
    }
}

/// Echo messages until the client closes or sends something unrecognized
pub async fn serve_echo<S, W>(mut ws: WebSocketStream<S>, client: IpAddr, log: &JsonLineLog<W>)
where
    S: AsyncRead + AsyncWrite + Unpin,
    W: Write + Send,
{
    while let Some(msg) = ws.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(%client, "echo channel error: {}", e);
                break;
            }
        };

        let raw = match &msg {
            Message::Text(text) => serde_json::from_str::<serde_json::Value>(text),
            Message::Binary(data) => serde_json::from_slice(data),
            Message::Close(_) => break,
            // Ping/Pong are answered by tungstenite
            _ => continue,
        };
        let parsed = raw.and_then(|raw| EchoMessage::from_value(&raw).map(|d| (raw, d)));
        let (raw, decoded) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(%client, "rejecting echo message: {}", e);
                break;
            }
        };

        if let EchoMessage::Final { uuid, .. } = &decoded {
            if Uuid::parse_str(uuid).is_ok() {
                if let Err(e) = log.append(&EchoRecord::new(client, &raw)) {
                    tracing::warn!(%client, "Failed to log echo result: {:#}", e);
                }
            } else {
                tracing::warn!(%client, uuid = %uuid, "final echo message with invalid UUID");
            }
        }

        if let Err(e) = ws.send(msg).await {
            tracing::debug!(%client, "echo send failed: {}", e);
            break;
        }
    }

    let _ = ws.close(None).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::Role;

    #[test]
    fn test_decode_latency() {
        let msg = EchoMessage::decode(r#"{"type":"ws-latency","seq":3,"sent_at":1714564800123.5}"#)
            .unwrap();
        assert_eq!(
            msg,
            EchoMessage::Latency {
                seq: 3,
                sent_at: 1714564800123.5
            }
        );
    }

    #[test]
    fn test_decode_final() {
        let msg = EchoMessage::decode(
            r#"{"type":"ws-final","UUID":"6f1c2b1e-8f2a-4c55-9d1e-3a0f6b7c8d9e","latencies":[10.5,11.0]}"#,
        )
        .unwrap();
        assert!(matches!(msg, EchoMessage::Final { ref latencies, .. } if latencies.len() == 2));
    }

    #[test]
    fn test_unknown_shapes_rejected() {
        assert!(EchoMessage::decode(r#"{"type":"hello"}"#).is_err());
        assert!(EchoMessage::decode(r#"{"seq":1,"sent_at":2.0}"#).is_err());
        assert!(EchoMessage::decode(r#"{"type":"ws-latency","seq":"x","sent_at":2.0}"#).is_err());
        assert!(EchoMessage::decode("not json").is_err());
    }

    async fn channel() -> (WebSocketStream<tokio::io::DuplexStream>, WebSocketStream<tokio::io::DuplexStream>) {
        let (a, b) = tokio::io::duplex(4096);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        (server, client)
    }

    #[tokio::test]
    async fn test_echo_and_log_final() {
        let (server, mut client) = channel().await;
        let log = JsonLineLog::from_writer(Vec::new());
        let ip: IpAddr = "203.0.113.4".parse().unwrap();

        let served = async {
            serve_echo(server, ip, &log).await;
        };
        let driven = async {
            let sample = r#"{"type":"ws-latency","seq":1,"sent_at":5.0}"#;
            client.send(Message::Text(sample.into())).await.unwrap();
            let echoed = client.next().await.unwrap().unwrap();
            assert_eq!(echoed, Message::Text(sample.into()));

            let last = r#"{"type":"ws-final","UUID":"6f1c2b1e-8f2a-4c55-9d1e-3a0f6b7c8d9e","latencies":[4.0],"browser":"test"}"#;
            client.send(Message::Text(last.into())).await.unwrap();
            client.next().await.unwrap().unwrap();
            client.close(None).await.unwrap();
            // Drain until the server finishes its side of the close
            while let Some(Ok(_)) = client.next().await {}
        };
        tokio::join!(served, driven);

        let out = String::from_utf8(log.into_inner()).unwrap();
        assert_eq!(out.lines().count(), 1);
        let line: serde_json::Value = serde_json::from_str(out.trim_end()).unwrap();
        assert_eq!(line["type"], "ws-final");
        assert_eq!(line["ip"], "203.0.113.4");
        assert_eq!(line["message"]["UUID"], "6f1c2b1e-8f2a-4c55-9d1e-3a0f6b7c8d9e");
        // Fields outside the typed message are kept
        assert_eq!(line["message"]["browser"], "test");
    }

    #[tokio::test]
    async fn test_unrecognized_message_closes_channel() {
        let (server, mut client) = channel().await;
        let log = JsonLineLog::from_writer(Vec::new());
        let ip: IpAddr = "203.0.113.4".parse().unwrap();

        let served = serve_echo(server, ip, &log);
        let driven = async {
            client
                .send(Message::Text(r#"{"type":"surprise"}"#.into()))
                .await
                .unwrap();
            // No echo: the next thing we see is the close handshake
            match client.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {}
                Some(Ok(other)) => panic!("unexpected echo: {:?}", other),
            }
        };
        tokio::join!(served, driven);
        assert!(log.into_inner().is_empty());
    }
}
