use dashmap::DashMap;
use envelope::Envelope;
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};

/// One outstanding correlated request: a single-slot delivery channel and the
/// absolute time after which the sweep may evict it.
struct PendingRequest {
    slot: oneshot::Sender<Envelope>,
    expires_at: Instant,
}

/// Outstanding requests keyed by the request envelope id.
#[derive(Default)]
pub(crate) struct PendingTable {
    entries: DashMap<String, PendingRequest>,
}

impl PendingTable {
    /// Registers `id` and returns the receiving half of its delivery slot.
    /// Registering an id twice replaces the earlier waiter, whose slot closes.
    pub(crate) fn register(&self, id: String, ttl: Duration) -> oneshot::Receiver<Envelope> {
        let (slot, receiver) = oneshot::channel();
        self.entries.insert(
            id,
            PendingRequest {
                slot,
                expires_at: Instant::now() + ttl,
            },
        );
        receiver
    }

    /// Hands a reply to its waiter.
    ///
    /// Lookup and removal are one step, so a reply is delivered at most once. Returns the
    /// envelope back when it is not a reply or nothing is waiting for it.
    pub(crate) fn resolve(&self, envelope: Envelope) -> Result<(), Envelope> {
        if !envelope.is_reply() {
            return Err(envelope);
        }
        match self.entries.remove(&envelope.reply_to) {
            Some((_, pending)) => {
                // A waiter that already gave up has dropped its receiver.
                let _ = pending.slot.send(envelope);
                Ok(())
            }
            None => Err(envelope),
        }
    }

    pub(crate) fn cancel(&self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Evicts entries past their expiry and returns how many were removed.
    pub(crate) fn sweep(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, pending| pending.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub(crate) fn clear(&self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
