use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;

/// Connection 4-tuple as it appears in the headers of an outgoing probe
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct FlowKey {
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

/// Identifies a pending probe for correlation with ICMP errors
///
/// Routers quote at least the IP header plus 8 bytes of the dropped datagram,
/// so both the TCP ports and the IPv4 total length survive in every error.
/// Probes on one connection differ only by length, which the sender varies.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProbeToken {
    pub flow: FlowKey,
    pub ip_len: u16,
}

impl ProbeToken {
    pub fn new(flow: FlowKey, ip_len: u16) -> Self {
        Self { flow, ip_len }
    }
}

impl fmt::Display for ProbeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{} len={}", self.flow.src, self.flow.dst, self.ip_len)
    }
}

/// What kind of reply resolved a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyKind {
    /// ICMP Time Exceeded from a router on the path
    TimeExceeded,
    /// ICMP Destination Unreachable with its code
    Unreachable(u8),
    /// The probe reached the traced peer itself
    Destination,
}

impl ReplyKind {
    pub fn status(self) -> HopStatus {
        match self {
            ReplyKind::TimeExceeded | ReplyKind::Destination => HopStatus::Answered,
            ReplyKind::Unreachable(_) => HopStatus::Unreachable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HopStatus {
    Answered,
    Timeout,
    Unreachable,
}

/// Outcome of probing a single TTL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopResult {
    pub ttl: u8,
    pub responder: Option<IpAddr>,
    #[serde(rename = "rtt_ms", with = "rtt_ms_serde")]
    pub rtt: Option<Duration>,
    pub status: HopStatus,
}

impl HopResult {
    pub fn resolved(ttl: u8, responder: IpAddr, rtt: Duration, kind: ReplyKind) -> Self {
        Self {
            ttl,
            responder: Some(responder),
            rtt: Some(rtt),
            status: kind.status(),
        }
    }

    pub fn timeout(ttl: u8) -> Self {
        Self {
            ttl,
            responder: None,
            rtt: None,
            status: HopStatus::Timeout,
        }
    }

    /// True if this hop was answered by the traced peer
    pub fn reached(&self, target: IpAddr) -> bool {
        self.responder == Some(target)
    }
}

/// Probing state machine for one traced connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Probing(u8),
    AwaitingResponse(u8),
    HopRecorded(u8),
    HopTimedOut(u8),
    Completed,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Aborted)
    }

    fn allows(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Completed | Aborted, _) => false,
            (_, Aborted) => true,
            (Idle, Probing(_)) => true,
            (Probing(a), AwaitingResponse(b)) => a == b,
            (AwaitingResponse(a), HopRecorded(b) | HopTimedOut(b)) => a == b,
            (HopRecorded(a) | HopTimedOut(a), Probing(b)) => b as u16 == a as u16 + 1,
            (HopRecorded(_) | HopTimedOut(_), Completed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("invalid session transition {from:?} -> {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },
    #[error("hop for TTL {got} recorded while in state {state:?}")]
    UnexpectedHop { state: SessionState, got: u8 },
}

/// One trace attempt over one client connection
#[derive(Debug, Clone)]
pub struct TraceSession {
    pub session_id: String,
    pub target: IpAddr,
    pub first_ttl: u8,
    pub max_hops: u8,
    pub hops: Vec<HopResult>,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
}

impl TraceSession {
    pub fn new(session_id: impl Into<String>, target: IpAddr, first_ttl: u8, max_hops: u8) -> Self {
        Self {
            session_id: session_id.into(),
            target,
            first_ttl: first_ttl.max(1),
            max_hops,
            hops: Vec::new(),
            state: SessionState::Idle,
            started_at: Utc::now(),
        }
    }

    pub fn transition(&mut self, next: SessionState) -> Result<(), SessionError> {
        if !self.state.allows(next) {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Leave `Idle` and probe the first TTL
    pub fn begin(&mut self) -> Result<u8, SessionError> {
        let ttl = self.first_ttl;
        self.transition(SessionState::Probing(ttl))?;
        Ok(ttl)
    }

    /// Append the hop for the TTL currently awaited
    ///
    /// Hops can only be appended from `AwaitingResponse(ttl)` with a matching
    /// TTL, which keeps the sequence contiguous and free of repeats.
    pub fn record(&mut self, hop: HopResult) -> Result<(), SessionError> {
        let next = match (self.state, hop.status) {
            (SessionState::AwaitingResponse(ttl), HopStatus::Timeout) if ttl == hop.ttl => {
                SessionState::HopTimedOut(ttl)
            }
            (SessionState::AwaitingResponse(ttl), _) if ttl == hop.ttl => {
                SessionState::HopRecorded(ttl)
            }
            (state, _) => {
                return Err(SessionError::UnexpectedHop {
                    state,
                    got: hop.ttl,
                });
            }
        };
        self.hops.push(hop);
        self.state = next;
        Ok(())
    }

    /// Decide what follows a recorded or timed-out hop
    pub fn advance(&mut self) -> Result<SessionState, SessionError> {
        let ttl = match self.state {
            SessionState::HopRecorded(ttl) | SessionState::HopTimedOut(ttl) => ttl,
            state => {
                return Err(SessionError::InvalidTransition {
                    from: state,
                    to: SessionState::Completed,
                });
            }
        };

        let reached = self.hops.last().is_some_and(|h| h.reached(self.target));
        let next = if reached || ttl >= self.max_hops {
            SessionState::Completed
        } else {
            SessionState::Probing(ttl + 1)
        };
        self.transition(next)?;
        Ok(next)
    }

    pub fn abort(&mut self) -> Result<(), SessionError> {
        self.transition(SessionState::Aborted)
    }

    pub fn reached(&self) -> bool {
        self.hops.last().is_some_and(|h| h.reached(self.target))
    }
}

/// Finalized, immutable outcome of a trace session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceResult {
    pub session_id: String,
    pub target: IpAddr,
    pub hops: Vec<HopResult>,
    /// Session ran to completion (destination reached or hop ceiling hit)
    pub completed: bool,
    /// Last hop was answered by the target itself
    pub reached: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl TraceResult {
    /// Freeze a terminated session
    pub fn freeze(session: TraceSession, ended_at: DateTime<Utc>) -> Self {
        let reached = session.reached();
        Self {
            completed: session.state == SessionState::Completed,
            reached,
            session_id: session.session_id,
            target: session.target,
            hops: session.hops,
            started_at: session.started_at,
            ended_at,
        }
    }
}

/// Serde helper for optional RTTs as fractional milliseconds
mod rtt_ms_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(rtt: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        rtt.map(|d| d.as_secs_f64() * 1000.0).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = Option::<f64>::deserialize(deserializer)?;
        Ok(ms.map(|ms| Duration::from_secs_f64(ms.max(0.0) / 1000.0)))
    }
}
