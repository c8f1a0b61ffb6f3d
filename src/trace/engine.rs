use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::TraceError;
use crate::export::TraceSink;
use crate::probe::{CaptureSocket, validate_interface};
use crate::state::{HopResult, ReplyKind, SessionError, SessionState, TraceResult, TraceSession};
use crate::trace::aggregate::Aggregator;
use crate::trace::pending::ProbeRegistry;
use crate::trace::receiver::{ListenerConfig, spawn_listener};
use crate::trace::sender::{ConnEvent, InFlight, ProbeSender, TraceConnection};

/// Why a session stopped before completing
enum Abort {
    Closed,
    Cancelled,
    Failed(TraceError),
}

impl From<SessionError> for Abort {
    fn from(e: SessionError) -> Self {
        Abort::Failed(e.into())
    }
}

/// How the wait in `AwaitingResponse` ended
enum Wait {
    Hop(HopResult),
    TimedOut,
    Closed,
    Cancelled,
}

/// Process-wide trace service: owns the capture socket's listener and the
/// probe registry, and runs one session per traced connection
pub struct TraceEngine {
    config: Config,
    registry: Arc<ProbeRegistry>,
    aggregator: Aggregator,
    cancel: CancellationToken,
    listener: Mutex<Option<JoinHandle<anyhow::Result<()>>>>,
}

impl TraceEngine {
    /// Validate the interface, open the capture socket and start listening
    ///
    /// Fails with [`TraceError::Config`] when capture is impossible; the
    /// service must not accept trace requests in that case.
    pub fn start(config: Config, sink: Arc<dyn TraceSink>) -> Result<Self, TraceError> {
        let interface = validate_interface(&config.interface)
            .map_err(|e| TraceError::Config(e.to_string()))?;
        let socket =
            CaptureSocket::open(&interface).map_err(|e| TraceError::Config(format!("{:#}", e)))?;

        let engine = Self::detached(config, sink);
        let handle = spawn_listener(
            socket,
            engine.registry.clone(),
            engine.cancel.clone(),
            ListenerConfig {
                reap_interval: engine.config.reap_interval,
            },
        )?;
        *engine.listener.lock() = Some(handle);

        tracing::info!(
            interface = %interface.name,
            address = %interface.ipv4,
            "capture socket open"
        );
        Ok(engine)
    }

    /// Engine without a capture socket; replies must be fed to the registry
    pub fn detached(config: Config, sink: Arc<dyn TraceSink>) -> Self {
        Self {
            config,
            registry: Arc::new(ProbeRegistry::new()),
            aggregator: Aggregator::new(sink),
            cancel: CancellationToken::new(),
            listener: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ProbeRegistry> {
        &self.registry
    }

    /// Trace the path to the peer of `conn`
    ///
    /// The connection is borrowed exclusively for the whole sweep and handed
    /// back untouched (TTL restored) once the result is known.
    pub async fn run_trace<C: TraceConnection>(
        &self,
        conn: &mut C,
        session_id: &str,
    ) -> Result<TraceResult, TraceError> {
        self.run_trace_with_cancel(conn, session_id, self.cancel.child_token())
            .await
    }

    /// Like [`run_trace`](Self::run_trace), aborting when `cancel` fires
    pub async fn run_trace_with_cancel<C: TraceConnection>(
        &self,
        conn: &mut C,
        session_id: &str,
        cancel: CancellationToken,
    ) -> Result<TraceResult, TraceError> {
        // Without the listener no router reply can ever be matched
        if self.listener_finished() {
            tracing::error!(session = session_id, "capture listener has stopped");
            return Err(TraceError::Config("capture listener has stopped".into()));
        }

        let sender = ProbeSender::new(conn, self.registry.clone(), self.config.hop_timeout);
        let target = match &sender {
            Ok(sender) => sender.flow().dst.ip(),
            Err(_) => conn
                .peer_addr()
                .map(|a| a.ip().to_canonical())
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        };

        let mut session = TraceSession::new(
            session_id,
            target,
            self.config.first_ttl,
            self.config.max_hops,
        );

        let outcome = match sender {
            Ok(mut sender) => self.drive(conn, &mut session, &mut sender, &cancel).await,
            Err(TraceError::Io(e)) => {
                tracing::debug!(session = session_id, "connection unusable: {}", e);
                Err(Abort::Closed)
            }
            Err(e) => Err(Abort::Failed(e)),
        };

        match outcome {
            Ok(()) => Ok(self.aggregator.finalize(session, None)),
            Err(abort) => {
                if !session.state.is_terminal() {
                    session.abort()?;
                }
                match abort {
                    Abort::Closed => {
                        let partial = self.aggregator.finalize(session, Some("connection closed"));
                        Err(TraceError::ConnectionClosed {
                            partial: Box::new(partial),
                        })
                    }
                    Abort::Cancelled => {
                        let partial = self.aggregator.finalize(session, Some("cancelled"));
                        Err(TraceError::Cancelled {
                            partial: Box::new(partial),
                        })
                    }
                    Abort::Failed(e) => {
                        self.aggregator.finalize(session, Some(&e.to_string()));
                        Err(e)
                    }
                }
            }
        }
    }

    /// Walk the state machine from `Idle` until it terminates
    async fn drive<C: TraceConnection>(
        &self,
        conn: &mut C,
        session: &mut TraceSession,
        sender: &mut ProbeSender,
        cancel: &CancellationToken,
    ) -> Result<(), Abort> {
        let mut ttl = session.begin()?;

        loop {
            // Earlier probes dropped by routers must be retransmitted first
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Abort::Cancelled),
                _ = sender.settle(conn) => {}
            }

            let hop = match sender.send(conn, ttl).await {
                Ok(probe) => {
                    session.transition(SessionState::AwaitingResponse(ttl))?;
                    match self.await_reply(conn, probe, session.target, cancel).await {
                        Wait::Hop(hop) => hop,
                        Wait::TimedOut => HopResult::timeout(ttl),
                        Wait::Closed => return Err(Abort::Closed),
                        Wait::Cancelled => return Err(Abort::Cancelled),
                    }
                }
                Err(TraceError::TokenCollision(token)) => {
                    // No probe went out; the TTL still gets its hop
                    tracing::warn!(%token, ttl, "giving up on hop after repeated collisions");
                    session.transition(SessionState::AwaitingResponse(ttl))?;
                    HopResult::timeout(ttl)
                }
                Err(TraceError::Io(e)) => {
                    tracing::debug!(session = %session.session_id, ttl, "probe send failed: {}", e);
                    return Err(Abort::Closed);
                }
                Err(e) => return Err(Abort::Failed(e)),
            };

            tracing::debug!(
                session = %session.session_id,
                ttl,
                responder = ?hop.responder,
                rtt = ?hop.rtt,
                status = ?hop.status,
                "hop"
            );
            session.record(hop)?;

            match session.advance()? {
                SessionState::Probing(next) => ttl = next,
                _ => return Ok(()),
            }
        }
    }

    /// Suspend until the probe is answered, times out, or the session ends
    async fn await_reply<C: TraceConnection>(
        &self,
        conn: &mut C,
        probe: InFlight,
        target: IpAddr,
        cancel: &CancellationToken,
    ) -> Wait {
        let InFlight {
            token,
            ttl,
            sent_at,
            deadline,
            payload,
            retrans_at_send,
            mut reply,
        } = probe;

        // A Pong for this exact Ping proves the probe reached the peer, unless
        // TCP retransmitted it at the default TTL in the meantime
        let echoed = async {
            loop {
                match conn.next_event().await {
                    ConnEvent::Echo(data) if data == payload => {
                        let received_at = Instant::now();
                        let retrans = conn.tcp_info().map(|i| i.total_retrans);
                        if retrans.is_ok_and(|r| r == retrans_at_send) {
                            return Some(received_at);
                        }
                        tracing::debug!(ttl, "echo after retransmission ignored");
                    }
                    ConnEvent::Echo(_) => {}
                    ConnEvent::Closed => return None,
                }
            }
        };

        let wait = tokio::select! {
            biased;
            _ = cancel.cancelled() => Wait::Cancelled,
            result = &mut reply => match result {
                Ok(hop) => Wait::Hop(hop),
                // Reaped before we noticed the deadline
                Err(_) => Wait::TimedOut,
            },
            echoed = echoed => match echoed {
                Some(at) => Wait::Hop(HopResult::resolved(
                    ttl,
                    target,
                    at.saturating_duration_since(sent_at),
                    ReplyKind::Destination,
                )),
                None => Wait::Closed,
            },
            _ = tokio::time::sleep_until(deadline) => Wait::TimedOut,
        };

        self.registry.release(&token);
        wait
    }

    /// Stop the listener and every running session
    pub fn shutdown(&self) -> anyhow::Result<()> {
        self.cancel.cancel();
        let Some(handle) = self.listener.lock().take() else {
            return Ok(());
        };
        match handle.join() {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("Listener thread panicked")),
        }
    }

    /// True once the listener thread has exited (error or shutdown)
    pub fn listener_finished(&self) -> bool {
        self.listener
            .lock()
            .as_ref()
            .is_some_and(|handle| handle.is_finished())
    }
}

impl Drop for TraceEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
