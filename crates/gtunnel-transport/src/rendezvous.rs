//! Keyed hand-off between a stream producer and a stream consumer
//!
//! Whichever side arrives first parks its half: a value offered before anyone
//! claims it is kept until claimed, and a claim made before the value arrives
//! waits for it (bounded by a timeout).
//!
//! Parked values and released keys expire after the rendezvous TTL, so a
//! value that shows up after its consumer gave up is dropped instead of being
//! handed to a later claim for the same key.

use crate::{TransportError, TransportResult};
use gtunnel_proto::ConnectionId;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// `(tunnel_id, connection_id)`
pub type StreamKey = (String, ConnectionId);

/// Default lifetime of a parked value or a released key
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

enum Slot<T> {
    Ready { value: T, parked_at: Instant },
    Waiting(oneshot::Sender<T>),
    /// The consumer released this key; a late offer is dropped
    Released { at: Instant },
}

impl<T> Slot<T> {
    fn expired(&self, ttl: Duration, now: Instant) -> bool {
        match self {
            Slot::Ready { parked_at, .. } => now.duration_since(*parked_at) >= ttl,
            Slot::Released { at } => now.duration_since(*at) >= ttl,
            Slot::Waiting(tx) => tx.is_closed(),
        }
    }
}

pub struct Rendezvous<T> {
    slots: Mutex<HashMap<StreamKey, Slot<T>>>,
    ttl: Duration,
}

impl<T: Send> Rendezvous<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            ttl: DEFAULT_TTL,
        }
    }

    /// How long an unclaimed value or a released key is remembered
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<StreamKey, Slot<T>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn purge_expired(&self, slots: &mut HashMap<StreamKey, Slot<T>>) {
        let now = Instant::now();
        let before = slots.len();
        slots.retain(|_, slot| !slot.expired(self.ttl, now));
        let purged = before - slots.len();
        if purged > 0 {
            debug!(purged, "Purged expired rendezvous slots");
        }
    }

    /// Deliver a value for `key`, waking a parked claim if there is one
    pub fn offer(&self, key: StreamKey, value: T) {
        let mut slots = self.slots();
        self.purge_expired(&mut slots);

        match slots.remove(&key) {
            Some(Slot::Waiting(tx)) => {
                if tx.send(value).is_err() {
                    debug!(
                        tunnel_id = %key.0,
                        connection_id = key.1,
                        "Claim gave up before the stream arrived"
                    );
                }
            }
            Some(Slot::Released { .. }) => {
                debug!(
                    tunnel_id = %key.0,
                    connection_id = key.1,
                    "Dropping stream for a released connection"
                );
            }
            Some(Slot::Ready { .. }) => {
                warn!(
                    tunnel_id = %key.0,
                    connection_id = key.1,
                    "Replacing unclaimed stream"
                );
                slots.insert(
                    key,
                    Slot::Ready {
                        value,
                        parked_at: Instant::now(),
                    },
                );
            }
            None => {
                slots.insert(
                    key,
                    Slot::Ready {
                        value,
                        parked_at: Instant::now(),
                    },
                );
            }
        }
    }

    /// Take the value for `key`, waiting up to `wait` for it to be offered
    pub async fn claim(&self, key: StreamKey, wait: Duration) -> TransportResult<T> {
        let rx = {
            let mut slots = self.slots();
            self.purge_expired(&mut slots);

            match slots.remove(&key) {
                Some(Slot::Ready { value, .. }) => return Ok(value),
                Some(Slot::Waiting(_previous)) => {
                    warn!(
                        tunnel_id = %key.0,
                        connection_id = key.1,
                        "Superseding an earlier claim"
                    );
                }
                Some(Slot::Released { .. }) | None => {}
            }
            let (tx, rx) = oneshot::channel();
            slots.insert(key.clone(), Slot::Waiting(tx));
            rx
        };

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(TransportError::Abandoned(key.1)),
            Err(_) => {
                let mut slots = self.slots();
                if matches!(slots.get(&key), Some(Slot::Waiting(tx)) if tx.is_closed()) {
                    slots.remove(&key);
                }
                Err(TransportError::Timeout)
            }
        }
    }

    /// Release `key`: drop whatever is parked and refuse a late offer
    ///
    /// Returns true if a value or claim was parked.
    pub fn cancel(&self, key: &StreamKey) -> bool {
        let previous = self
            .slots()
            .insert(key.clone(), Slot::Released { at: Instant::now() });
        matches!(previous, Some(Slot::Ready { .. } | Slot::Waiting(_)))
    }

    /// Forget every key of `tunnel_id`, parked values and claims included
    ///
    /// Connection ids restart with each session, so nothing may carry over.
    pub fn purge_tunnel(&self, tunnel_id: &str) -> usize {
        let mut slots = self.slots();
        let before = slots.len();
        slots.retain(|(tunnel, _), _| tunnel != tunnel_id);
        before - slots.len()
    }

    /// Number of keys with a parked value or claim
    pub fn pending(&self) -> usize {
        self.slots()
            .values()
            .filter(|slot| !matches!(slot, Slot::Released { .. }))
            .count()
    }
}

impl<T: Send> Default for Rendezvous<T> {
    fn default() -> Self {
        Self::new()
    }
}
