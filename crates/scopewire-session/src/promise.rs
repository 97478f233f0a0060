//! Promise correlator -- outstanding two-way calls awaiting their responses.
//!
//! Ids are unique among the issuing endpoint's outstanding promises; on the
//! server they are additionally scoped per target peer so two peers' id
//! spaces cannot interfere. A promise is destroyed by exactly one of: the
//! correlated response arriving, or the owning peer disconnecting. There is
//! no timeout; callers wanting bounded waits wrap the receiver themselves.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use scopewire_protocol::{FrameReader, PromiseId, SignalHash};
use tokio::sync::oneshot;

use crate::error::SessionError;
use crate::peer::PeerId;

/// Terminal state of a two-way call.
#[derive(Debug)]
pub enum PromiseOutcome {
    /// The correlated response payload, still encoded; the caller decodes
    /// it with the type it knows.
    Resolved(Bytes),
    /// The owning peer disconnected before responding.
    Cancelled,
}

/// What [`PromiseCorrelator::try_resolve`] made of an inbound frame.
pub enum ResolveOutcome {
    /// A pending promise was completed.
    Resolved,
    /// The hash is a known response hash but no promise matched: stale or
    /// duplicate response. Logged by the caller, frame dropped.
    UnknownPromise(PromiseId),
    /// Not a response hash at all; dispatch elsewhere.
    NotAResponse,
}

struct Pending {
    response_hash: SignalHash,
    tx: oneshot::Sender<PromiseOutcome>,
}

#[derive(Default)]
pub struct PromiseCorrelator {
    pending: HashMap<(PeerId, PromiseId), Pending>,
    counters: HashMap<PeerId, PromiseId>,
    /// Every response hash ever enqueued. Lets a duplicate response be
    /// recognized as a stale promise rather than an unbound signal.
    response_hashes: HashSet<SignalHash>,
}

impl PromiseCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a promise id for `peer` and store the pending continuation.
    /// Returns the id and the receiver the caller awaits.
    pub fn enqueue(
        &mut self,
        peer: PeerId,
        response_hash: SignalHash,
    ) -> (PromiseId, oneshot::Receiver<PromiseOutcome>) {
        let counter = self.counters.entry(peer).or_insert(0);
        loop {
            *counter = counter.wrapping_add(1);
            if !self.pending.contains_key(&(peer, *counter)) {
                break;
            }
        }
        let id = *counter;
        let (tx, rx) = oneshot::channel();
        self.response_hashes.insert(response_hash);
        self.pending.insert((peer, id), Pending { response_hash, tx });
        (id, rx)
    }

    /// Attempt to treat an inbound scope frame (hash already read) as a
    /// two-way response from `peer`.
    pub fn try_resolve(
        &mut self,
        peer: PeerId,
        hash: SignalHash,
        r: &mut FrameReader,
    ) -> Result<ResolveOutcome, SessionError> {
        if !self.response_hashes.contains(&hash) {
            return Ok(ResolveOutcome::NotAResponse);
        }
        let id = r.u32()?;
        match self.pending.remove(&(peer, id)) {
            Some(pending) if pending.response_hash == hash => {
                let _ = pending.tx.send(PromiseOutcome::Resolved(r.rest()));
                Ok(ResolveOutcome::Resolved)
            }
            Some(pending) => {
                // Same id, different signal: corrupt or crossed response.
                // The promise stays pending for its real response.
                self.pending.insert((peer, id), pending);
                Ok(ResolveOutcome::UnknownPromise(id))
            }
            None => Ok(ResolveOutcome::UnknownPromise(id)),
        }
    }

    /// Cancel every promise still pending for `peer`. Returns how many were
    /// cancelled; each awaiting caller observes [`PromiseOutcome::Cancelled`].
    pub fn cancel_peer(&mut self, peer: PeerId) -> usize {
        let stale: Vec<_> = self
            .pending
            .keys()
            .filter(|(p, _)| *p == peer)
            .copied()
            .collect();
        for key in &stale {
            if let Some(pending) = self.pending.remove(key) {
                let _ = pending.tx.send(PromiseOutcome::Cancelled);
            }
        }
        self.counters.remove(&peer);
        stale.len()
    }

    /// Cancel everything (client-side connection loss).
    pub fn cancel_all(&mut self) -> usize {
        let count = self.pending.len();
        for (_, pending) in self.pending.drain() {
            let _ = pending.tx.send(PromiseOutcome::Cancelled);
        }
        self.counters.clear();
        count
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    pub fn outstanding_for(&self, peer: PeerId) -> usize {
        self.pending.keys().filter(|(p, _)| *p == peer).count()
    }
}
