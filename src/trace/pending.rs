//! Shared pending probe tracking.
//!
//! Senders insert an entry before a probe leaves; the response listener
//! removes it when the matching ICMP error arrives and wakes the waiting
//! session through a oneshot channel. Entries nobody answered are evicted by
//! the reaper once their deadline passes.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::TraceError;
use crate::state::{HopResult, ProbeToken, ReplyKind};

/// A probe that has been sent and is awaiting a response
#[derive(Debug)]
pub struct PendingProbe {
    pub ttl: u8,
    pub sent_at: Instant,
    pub deadline: Instant,
    reply: oneshot::Sender<HopResult>,
}

/// Read-only view of a pending entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingSnapshot {
    pub token: ProbeToken,
    pub ttl: u8,
    pub sent_at: Instant,
}

/// Concurrent token -> pending slot table shared by all sessions
#[derive(Debug, Default)]
pub struct ProbeRegistry {
    entries: Mutex<HashMap<ProbeToken, PendingProbe>>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a probe and return the receiver its result will arrive on
    ///
    /// A token that is still pending is never replaced.
    pub fn register(
        &self,
        token: ProbeToken,
        ttl: u8,
        sent_at: Instant,
        deadline: Instant,
    ) -> Result<oneshot::Receiver<HopResult>, TraceError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&token) {
            return Err(TraceError::TokenCollision(token));
        }

        let (tx, rx) = oneshot::channel();
        entries.insert(
            token,
            PendingProbe {
                ttl,
                sent_at,
                deadline,
                reply: tx,
            },
        );
        Ok(rx)
    }

    /// Match a reply against the table and hand the hop to its session
    ///
    /// Returns false if the token is unknown or its session stopped listening.
    pub fn resolve(
        &self,
        token: &ProbeToken,
        responder: IpAddr,
        kind: ReplyKind,
        received_at: Instant,
    ) -> bool {
        let Some(probe) = self.entries.lock().remove(token) else {
            return false;
        };

        let rtt = received_at.saturating_duration_since(probe.sent_at);
        let hop = HopResult::resolved(probe.ttl, responder, rtt, kind);
        probe.reply.send(hop).is_ok()
    }

    /// Move an entry's send time and deadline to when it actually left
    ///
    /// Returns false if the token is no longer pending.
    pub fn restamp(&self, token: &ProbeToken, sent_at: Instant, deadline: Instant) -> bool {
        match self.entries.lock().get_mut(token) {
            Some(probe) => {
                probe.sent_at = sent_at;
                probe.deadline = deadline;
                true
            }
            None => false,
        }
    }

    /// Drop an entry without delivering anything
    pub fn release(&self, token: &ProbeToken) -> bool {
        self.entries.lock().remove(token).is_some()
    }

    /// Evict entries whose deadline has passed, returning how many were removed
    pub fn reap_expired(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, probe| probe.deadline > now && !probe.reply.is_closed());
        before - entries.len()
    }

    pub fn contains(&self, token: &ProbeToken) -> bool {
        self.entries.lock().contains_key(token)
    }

    pub fn pending(&self) -> Vec<PendingSnapshot> {
        self.entries
            .lock()
            .iter()
            .map(|(token, probe)| PendingSnapshot {
                token: *token,
                ttl: probe.ttl,
                sent_at: probe.sent_at,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
