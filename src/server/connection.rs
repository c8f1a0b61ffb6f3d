//! Traced-connection adapter over an upgraded WebSocket stream.
//!
//! Probes are ordinary Ping messages; the TTL is lowered on the underlying
//! socket for the duration of each write. Pongs read back from the stream are
//! the destination's answers. Client Pings are answered by tungstenite.

use futures::{SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::probe::{self, TcpInfo};
use crate::trace::{ConnEvent, TraceConnection};

/// How long a closing client gets to answer our Close frame
const CLOSE_LINGER: Duration = Duration::from_secs(2);

pub struct WsTraceConnection {
    ws: WebSocketStream<TcpStream>,
}

fn into_io(e: tungstenite::Error) -> io::Error {
    match e {
        tungstenite::Error::Io(e) => e,
        other => io::Error::other(other),
    }
}

impl WsTraceConnection {
    pub fn new(ws: WebSocketStream<TcpStream>) -> io::Result<Self> {
        // Each probe must leave as its own segment
        ws.get_ref().set_nodelay(true)?;
        Ok(Self { ws })
    }

    fn stream(&self) -> &TcpStream {
        self.ws.get_ref()
    }

    pub async fn send_text(&mut self, text: &str) -> io::Result<()> {
        self.ws
            .send(Message::Text(text.to_owned()))
            .await
            .map_err(into_io)
    }

    /// Start the closing handshake and wait briefly for the client's reply
    pub async fn close(&mut self) -> io::Result<()> {
        self.ws.close(None).await.map_err(into_io)?;
        let drain = async { while let Some(Ok(_)) = self.ws.next().await {} };
        if tokio::time::timeout(CLOSE_LINGER, drain).await.is_err() {
            tracing::debug!("client did not finish the close handshake");
        }
        Ok(())
    }
}

impl TraceConnection for WsTraceConnection {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream().local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream().peer_addr()
    }

    fn ttl(&self) -> io::Result<u32> {
        probe::ttl(self.stream())
    }

    fn set_ttl(&self, ttl: u32) -> io::Result<()> {
        probe::set_ttl(self.stream(), ttl)
    }

    fn tcp_info(&self) -> io::Result<TcpInfo> {
        probe::tcp_info(self.stream())
    }

    async fn send_probe(&mut self, payload: &[u8]) -> io::Result<()> {
        self.ws
            .send(Message::Ping(payload.to_vec()))
            .await
            .map_err(into_io)
    }

    async fn next_event(&mut self) -> ConnEvent {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Pong(payload))) => return ConnEvent::Echo(payload),
                Some(Ok(Message::Close(_))) | None => return ConnEvent::Closed,
                // Data messages and client pings carry nothing for the trace
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::trace!("client stream ended: {}", e);
                    return ConnEvent::Closed;
                }
            }
        }
    }
}
