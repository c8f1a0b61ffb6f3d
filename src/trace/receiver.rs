use anyhow::Result;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::probe::{CaptureSocket, PacketError, ParsedReply, parse_icmp_reply};
use crate::state::ProbeToken;
use crate::trace::pending::ProbeRegistry;

/// Configuration for the response listener
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// How often expired registry entries are evicted
    pub reap_interval: Duration,
}

/// Maximum consecutive errors before stopping the listener
const MAX_CONSECUTIVE_ERRORS: u32 = 50;

/// Maximum packets to drain per iteration before yielding to the reaper
const MAX_DRAIN_BATCH: usize = 100;

/// Largest datagram we expect on the capture socket
const CAPTURE_BUFFER_LEN: usize = 1500;

/// What happened to one captured packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Matched a pending probe and woke its session
    Delivered(ProbeToken),
    /// Parsed fine but no live probe owns the token
    Unmatched(ProbeToken),
    /// Not a usable ICMP error
    Malformed(PacketError),
}

/// Parse one captured datagram and resolve it against the registry
///
/// Never fails: anything that does not match a live probe is dropped.
pub fn dispatch_packet(
    registry: &ProbeRegistry,
    data: &[u8],
    source: IpAddr,
    received_at: Instant,
) -> Dispatch {
    let ParsedReply {
        responder,
        kind,
        token,
        quoted_ttl,
    } = match parse_icmp_reply(data, source) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::trace!(%source, "dropping packet: {}", e);
            return Dispatch::Malformed(e);
        }
    };

    if registry.resolve(&token, responder, kind, received_at) {
        tracing::debug!(%token, %responder, ?kind, quoted_ttl, "probe answered");
        Dispatch::Delivered(token)
    } else {
        tracing::trace!(%token, %responder, "no pending probe for reply");
        Dispatch::Unmatched(token)
    }
}

/// Sole reader of the capture socket; demultiplexes ICMP errors to sessions
pub struct ResponseListener {
    socket: CaptureSocket,
    registry: Arc<ProbeRegistry>,
    cancel: CancellationToken,
    config: ListenerConfig,
    consecutive_errors: u32,
}

impl ResponseListener {
    pub fn new(
        socket: CaptureSocket,
        registry: Arc<ProbeRegistry>,
        cancel: CancellationToken,
        config: ListenerConfig,
    ) -> Self {
        Self {
            socket,
            registry,
            cancel,
            config,
            consecutive_errors: 0,
        }
    }

    /// Run the listener on a dedicated thread (blocking I/O)
    pub fn run_blocking(mut self) -> Result<()> {
        let mut buffer = [0u8; CAPTURE_BUFFER_LEN];
        let mut last_reap = Instant::now();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            // Drain what is queued, bounded so the reaper still gets a turn
            for _ in 0..MAX_DRAIN_BATCH {
                match self.socket.recv(&mut buffer) {
                    Ok((len, source)) => {
                        self.consecutive_errors = 0;
                        dispatch_packet(&self.registry, &buffer[..len], source, Instant::now());
                    }
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        self.consecutive_errors = 0;
                        break;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        self.consecutive_errors += 1;
                        tracing::warn!(
                            "Capture receive error ({}/{}): {}",
                            self.consecutive_errors,
                            MAX_CONSECUTIVE_ERRORS,
                            e
                        );
                        if self.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                            return Err(anyhow::anyhow!(
                                "Listener stopped: {} consecutive errors (last: {})",
                                self.consecutive_errors,
                                e
                            ));
                        }
                        break;
                    }
                }
            }

            let now = Instant::now();
            if now.duration_since(last_reap) >= self.config.reap_interval {
                let evicted = self.registry.reap_expired(now);
                if evicted > 0 {
                    tracing::debug!(evicted, "reaped expired probes");
                }
                last_reap = now;
            }
        }

        Ok(())
    }
}

/// Spawn the listener on its own OS thread
pub fn spawn_listener(
    socket: CaptureSocket,
    registry: Arc<ProbeRegistry>,
    cancel: CancellationToken,
    config: ListenerConfig,
) -> std::io::Result<std::thread::JoinHandle<Result<()>>> {
    std::thread::Builder::new()
        .name("icmp-listener".into())
        .spawn(move || {
            let listener = ResponseListener::new(socket, registry, cancel, config);

            // Catch panics and convert to error with details
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener.run_blocking()))
            {
                Ok(result) => result,
                Err(panic_payload) => {
                    let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                        s.to_string()
                    } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "unknown panic".to_string()
                    };
                    Err(anyhow::anyhow!("Listener panicked: {}", msg))
                }
            }
        })
}
