use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::TraceError;
use crate::probe::TcpInfo;
use crate::state::{FlowKey, HopResult, ProbeToken};
use crate::trace::pending::ProbeRegistry;

/// Fresh tokens tried for one TTL before the hop is given up
pub const MAX_TOKEN_ATTEMPTS: usize = 4;

/// Shortest probe payload: magic (2) + serial (2) + ttl (1) + padding
pub const MIN_PROBE_PAYLOAD: usize = 8;
/// Number of distinct probe lengths on one connection
pub const PROBE_LEN_SPAN: usize = 96;
/// Control frames carry at most 125 payload bytes
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// How often TCP_INFO is polled while earlier data is still unacknowledged
const ACK_POLL_INTERVAL: Duration = Duration::from_millis(5);
/// Longest wait for the connection to go quiet before probing anyway
const MAX_ACK_WAIT: Duration = Duration::from_secs(3);

const PROBE_MAGIC: [u8; 2] = *b"0t";

/// Build the Ping payload for a probe
///
/// The length is derived from `serial`, so consecutive serials produce
/// distinct lengths for `PROBE_LEN_SPAN` probes.
pub fn probe_payload(serial: u16, ttl: u8) -> Vec<u8> {
    let len = MIN_PROBE_PAYLOAD + (serial as usize % PROBE_LEN_SPAN);
    let mut payload = Vec::with_capacity(len);
    payload.extend_from_slice(&PROBE_MAGIC);
    payload.extend_from_slice(&serial.to_be_bytes());
    payload.push(ttl);
    let mut fill = 0u8;
    while payload.len() < len {
        payload.push(fill);
        fill = fill.wrapping_add(1);
    }
    payload
}

/// Bytes a server Ping with this payload occupies on the wire
///
/// Server frames are unmasked and probe payloads fit the 7-bit length, so the
/// header is always two bytes.
pub fn ping_wire_len(payload_len: usize) -> usize {
    2 + payload_len
}

/// Something the peer did on the traced connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnEvent {
    /// Pong carrying this payload
    Echo(Vec<u8>),
    /// Peer closed the connection or it failed
    Closed,
}

/// An established connection a session can probe through
///
/// Implemented by the WebSocket adapter in production and by mocks in tests.
pub trait TraceConnection: Send {
    fn local_addr(&self) -> io::Result<SocketAddr>;
    fn peer_addr(&self) -> io::Result<SocketAddr>;
    fn ttl(&self) -> io::Result<u32>;
    fn set_ttl(&self, ttl: u32) -> io::Result<()>;
    fn tcp_info(&self) -> io::Result<TcpInfo>;

    /// Send a Ping carrying `payload` and flush it as a single segment
    fn send_probe(&mut self, payload: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// Next event from the peer; must be cancel-safe
    fn next_event(&mut self) -> impl Future<Output = ConnEvent> + Send;
}

/// A probe on the wire, waiting for its hop
#[derive(Debug)]
pub struct InFlight {
    pub token: ProbeToken,
    pub ttl: u8,
    pub sent_at: Instant,
    pub deadline: Instant,
    /// Ping payload the peer will echo if the probe reaches it
    pub payload: Vec<u8>,
    /// Retransmission counter before the send
    pub retrans_at_send: u32,
    pub reply: oneshot::Receiver<HopResult>,
}

/// Emits TTL-limited probes on one connection
#[derive(Debug)]
pub struct ProbeSender {
    registry: Arc<ProbeRegistry>,
    flow: FlowKey,
    /// IPv4 + TCP header bytes in front of each probe frame
    overhead: usize,
    default_ttl: u32,
    hop_timeout: Duration,
    serial: u16,
}

/// Map IPv4-mapped IPv6 addresses from dual-stack listeners back to IPv4
fn canonical(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(addr.ip().to_canonical(), addr.port())
}

impl ProbeSender {
    pub fn new<C: TraceConnection>(
        conn: &C,
        registry: Arc<ProbeRegistry>,
        hop_timeout: Duration,
    ) -> Result<Self, TraceError> {
        let flow = FlowKey {
            src: canonical(conn.local_addr()?),
            dst: canonical(conn.peer_addr()?),
        };
        if !matches!(flow.dst.ip(), IpAddr::V4(_)) {
            return Err(TraceError::Config(format!(
                "cannot trace {}: only IPv4 connections are supported",
                flow.dst
            )));
        }

        let overhead = conn.tcp_info()?.segment_overhead();
        let default_ttl = conn.ttl()?;

        Ok(Self {
            registry,
            flow,
            overhead,
            default_ttl,
            hop_timeout,
            serial: 0,
        })
    }

    pub fn flow(&self) -> FlowKey {
        self.flow
    }

    /// Wait until everything sent so far has been acknowledged
    ///
    /// A probe dropped by a router is later retransmitted at the default TTL.
    /// Until that happens the peer holds newer data out of order, so the next
    /// probe would only be echoed after the retransmission. Returns false if
    /// the connection stayed busy for [`MAX_ACK_WAIT`].
    pub async fn settle<C: TraceConnection>(&self, conn: &mut C) -> bool {
        let give_up = Instant::now() + MAX_ACK_WAIT;
        loop {
            match conn.tcp_info() {
                Ok(info) if info.unacked == 0 => return true,
                Ok(_) => {}
                // The send that follows reports the broken connection
                Err(_) => return true,
            }
            if Instant::now() >= give_up {
                tracing::debug!(flow = ?self.flow, "connection still has unacknowledged data");
                return false;
            }
            tokio::time::sleep(ACK_POLL_INTERVAL).await;
        }
    }

    /// Send one probe at `ttl` and register it
    ///
    /// The connection's TTL is restored before returning, whether or not the
    /// write succeeded. An I/O error means the connection is unusable.
    pub async fn send<C: TraceConnection>(
        &mut self,
        conn: &mut C,
        ttl: u8,
    ) -> Result<InFlight, TraceError> {
        let retrans_at_send = conn.tcp_info().map(|i| i.total_retrans).unwrap_or(0);

        // Register before sending so a fast reply always finds its entry
        let mut attempts = 0;
        let (token, payload, reply) = loop {
            self.serial = self.serial.wrapping_add(1);
            let payload = probe_payload(self.serial, ttl);
            let ip_len = self.overhead + ping_wire_len(payload.len());
            let token = ProbeToken::new(self.flow, ip_len as u16);

            let now = Instant::now();
            match self.registry.register(token, ttl, now, now + self.hop_timeout) {
                Ok(reply) => break (token, payload, reply),
                Err(e) => {
                    attempts += 1;
                    tracing::warn!(%token, ttl, attempts, "probe token collision");
                    if attempts >= MAX_TOKEN_ATTEMPTS {
                        return Err(e);
                    }
                }
            }
        };

        let sent = self.transmit(conn, &token, ttl, &payload).await;
        let restored = conn.set_ttl(self.default_ttl);
        let (sent_at, deadline) = match sent.and_then(|stamps| restored.map(|()| stamps)) {
            Ok(stamps) => stamps,
            Err(e) => {
                self.registry.release(&token);
                return Err(e.into());
            }
        };

        tracing::debug!(%token, ttl, "probe sent");
        Ok(InFlight {
            token,
            ttl,
            sent_at,
            deadline,
            payload,
            retrans_at_send,
            reply,
        })
    }

    /// Lower the TTL, stamp the entry and write; returns (sent_at, deadline)
    async fn transmit<C: TraceConnection>(
        &self,
        conn: &mut C,
        token: &ProbeToken,
        ttl: u8,
        payload: &[u8],
    ) -> io::Result<(Instant, Instant)> {
        conn.set_ttl(ttl as u32)?;

        let sent_at = Instant::now();
        let deadline = sent_at + self.hop_timeout;
        self.registry.restamp(token, sent_at, deadline);

        conn.send_probe(payload).await?;
        Ok((sent_at, deadline))
    }
}
