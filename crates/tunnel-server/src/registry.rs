//! Client registry: tunnel id -> last known endpoint and liveness

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;

use crate::packet::same_endpoint;
use crate::rate_limit::ConnectionCounter;

/// Lowest id handed out by lobby reservations; 0 is the ping id
pub const RESERVED_ID_MIN: u32 = 1;
/// Exclusive upper bound of lobby reservation ids (fits a signed 16-bit id)
pub const RESERVED_ID_LIMIT: u32 = i16::MAX as u32;

const MAX_RESERVE_ATTEMPTS: usize = 1024;

/// One registered tunnel participant
#[derive(Debug, Clone, Copy)]
pub struct TunnelClient {
    /// Last endpoint seen for this id, `None` for an unbound reservation
    pub endpoint: Option<SocketAddr>,
    pub last_receive: Instant,
    timeout: Duration,
}

impl TunnelClient {
    pub fn new(endpoint: Option<SocketAddr>, timeout: Duration, now: Instant) -> Self {
        Self {
            endpoint,
            last_receive: now,
            timeout,
        }
    }

    pub fn timed_out(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_receive) >= self.timeout
    }

    fn touch(&mut self, now: Instant) {
        self.last_receive = now;
    }

    /// Canonical IP of the bound endpoint
    pub fn ip(&self) -> Option<IpAddr> {
        self.endpoint.map(|endpoint| endpoint.ip().to_canonical())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("registry is full")]
    Full,
    #[error("maintenance mode is enabled")]
    Maintenance,
    #[error("IP connection limit reached")]
    IpLimit,
    #[error("client is still live on another endpoint")]
    Live,
    #[error("client not found")]
    NotFound,
}

/// Result of admitting a previously unknown id
#[derive(Debug, Clone, Copy)]
pub enum Admission {
    Admitted(TunnelClient),
    /// Another packet registered the id first
    Exists,
    Denied(AdmissionError),
}

/// Result of a V2 packet arriving for a reserved id
#[derive(Debug, Clone, Copy)]
pub enum BindOutcome {
    /// First packet for the reservation; the endpoint is now bound
    Bound(TunnelClient),
    Touched(TunnelClient),
    /// Bound to a different endpoint
    Mismatch(SocketAddr),
    Unknown,
}

/// Concurrent id -> client table with a fixed capacity
pub struct ClientRegistry {
    clients: DashMap<u32, TunnelClient>,
    /// Slots taken, including admissions in progress
    slots: AtomicUsize,
    capacity: usize,
    timeout: Duration,
}

impl ClientRegistry {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        Self {
            clients: DashMap::with_capacity(capacity),
            slots: AtomicUsize::new(0),
            capacity,
            timeout,
        }
    }

    /// Current number of registered clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Distinct addresses among bound clients
    pub fn distinct_ips(&self) -> usize {
        self.clients
            .iter()
            .filter_map(|entry| entry.value().ip())
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn get(&self, id: u32) -> Option<TunnelClient> {
        self.clients.get(&id).map(|entry| *entry.value())
    }

    fn take_slots(&self, count: usize) -> bool {
        self.slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |taken| {
                (taken + count <= self.capacity).then_some(taken + count)
            })
            .is_ok()
    }

    fn free_slots(&self, count: usize) {
        self.slots.fetch_sub(count, Ordering::AcqRel);
    }

    /// Register a new id bound to `endpoint`.
    ///
    /// The id is inserted at most once even under concurrent calls; the
    /// losers get [`Admission::Exists`]. Capacity, maintenance mode and the
    /// per-IP connection limit are checked before inserting, and every
    /// reservation taken along the way is rolled back on denial.
    pub fn try_admit(
        &self,
        id: u32,
        endpoint: SocketAddr,
        now: Instant,
        maintenance: bool,
        connections: &ConnectionCounter,
    ) -> Admission {
        if self.clients.contains_key(&id) {
            return Admission::Exists;
        }
        if maintenance {
            return Admission::Denied(AdmissionError::Maintenance);
        }
        if !self.take_slots(1) {
            return Admission::Denied(AdmissionError::Full);
        }

        match self.clients.entry(id) {
            Entry::Occupied(_) => {
                self.free_slots(1);
                Admission::Exists
            }
            Entry::Vacant(vacant) => {
                if !connections.try_acquire(endpoint.ip()) {
                    self.free_slots(1);
                    return Admission::Denied(AdmissionError::IpLimit);
                }
                let client = TunnelClient::new(Some(endpoint), self.timeout, now);
                vacant.insert(client);
                Admission::Admitted(client)
            }
        }
    }

    /// Refresh the liveness of an existing client. The endpoint is untouched.
    pub fn touch(&self, id: u32, now: Instant) -> Option<TunnelClient> {
        let mut client = self.clients.get_mut(&id)?;
        client.touch(now);
        Some(*client)
    }

    /// Move a timed-out client to a new endpoint.
    ///
    /// A packet from the already bound endpoint just touches the client. A
    /// different endpoint is accepted only when the client has timed out,
    /// maintenance mode is off and the new address has a free connection
    /// slot; the connection count moves from the old address to the new one.
    /// The check and the swap happen under the entry lock, so a sweep or a
    /// competing rebind cannot interleave.
    pub fn rebind(
        &self,
        id: u32,
        endpoint: SocketAddr,
        now: Instant,
        maintenance: bool,
        connections: &ConnectionCounter,
    ) -> Result<TunnelClient, AdmissionError> {
        let mut client = self.clients.get_mut(&id).ok_or(AdmissionError::NotFound)?;

        if let Some(current) = client.endpoint {
            if same_endpoint(current, endpoint) {
                client.touch(now);
                return Ok(*client);
            }
        }
        if !client.timed_out(now) {
            return Err(AdmissionError::Live);
        }
        if maintenance {
            return Err(AdmissionError::Maintenance);
        }

        let moved = match client.endpoint {
            Some(previous) => connections.transfer(previous.ip(), endpoint.ip()),
            None => connections.try_acquire(endpoint.ip()),
        };
        if !moved {
            return Err(AdmissionError::IpLimit);
        }

        client.endpoint = Some(endpoint);
        client.touch(now);
        Ok(*client)
    }

    /// Bind a reserved id to the first endpoint that uses it; afterwards only
    /// that exact endpoint is accepted.
    pub fn bind_or_touch(&self, id: u32, endpoint: SocketAddr, now: Instant) -> BindOutcome {
        let Some(mut client) = self.clients.get_mut(&id) else {
            return BindOutcome::Unknown;
        };

        match client.endpoint {
            None => {
                client.endpoint = Some(endpoint);
                client.touch(now);
                BindOutcome::Bound(*client)
            }
            Some(current) if same_endpoint(current, endpoint) => {
                client.touch(now);
                BindOutcome::Touched(*client)
            }
            Some(current) => BindOutcome::Mismatch(current),
        }
    }

    /// Reserve `count` fresh random ids for a lobby.
    ///
    /// Capacity for all of them is taken up front; ids that could not be
    /// placed are handed back. The returned list may be shorter than `count`
    /// (empty when the registry lacks room).
    pub fn reserve(&self, count: usize, now: Instant) -> Vec<u32> {
        if count == 0 || !self.take_slots(count) {
            return Vec::new();
        }

        let mut rng = rand::thread_rng();
        let mut ids = Vec::with_capacity(count);
        let mut attempts = 0;

        while ids.len() < count && attempts < MAX_RESERVE_ATTEMPTS {
            attempts += 1;
            let id = rng.gen_range(RESERVED_ID_MIN..RESERVED_ID_LIMIT);
            if let Entry::Vacant(vacant) = self.clients.entry(id) {
                vacant.insert(TunnelClient::new(None, self.timeout, now));
                ids.push(id);
            }
        }

        let missing = count - ids.len();
        if missing > 0 {
            self.free_slots(missing);
        }
        ids
    }

    /// Remove every timed-out client, calling `on_evict` for each one before
    /// it is dropped. Returns the number of evictions.
    ///
    /// Shards are locked one at a time, so lookups for ids in other shards
    /// proceed while the sweep runs.
    pub fn sweep_expired<F>(&self, now: Instant, mut on_evict: F) -> usize
    where
        F: FnMut(u32, &TunnelClient),
    {
        let mut evicted = 0;

        self.clients.retain(|id, client| {
            if client.timed_out(now) {
                on_evict(*id, client);
                evicted += 1;
                false
            } else {
                true
            }
        });

        if evicted > 0 {
            self.free_slots(evicted);
        }
        evicted
    }
}
