//! Producer credit flow control
//!
//! A producer may only send as many bytes as the server granted for its
//! address. Grants are tracked per address in [`ProducerCredits`]; the
//! [`ProducerCreditManager`] shares them between the producers of one
//! session and keeps a bounded cache of credits nobody references any more.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, trace};

use crate::{CorvidError, Result};

/// Capacity of the cache of unreferenced credits
pub const MAX_UNREFERENCED_CREDITS: usize = 1000;

/// Sends credit requests to the server
pub trait CreditRequester: Send + Sync {
    fn request_credits(&self, address: &str, credits: i32);
}

/// Send window for one address
pub struct ProducerCredits {
    address: String,
    /// -1 disables flow control
    window_size: i32,
    granted: Semaphore,
    /// Requested from the server and not granted yet
    pending: Mutex<i64>,
    requester: Arc<dyn CreditRequester>,
}

impl std::fmt::Debug for ProducerCredits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerCredits")
            .field("address", &self.address)
            .field("window_size", &self.window_size)
            .field("available", &self.available())
            .field("pending", &*self.pending.lock())
            .finish()
    }
}

impl ProducerCredits {
    fn new(address: String, window_size: i32, requester: Arc<dyn CreditRequester>) -> Self {
        Self {
            address,
            window_size,
            granted: Semaphore::new(0),
            pending: Mutex::new(0),
            requester,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn window_size(&self) -> i32 {
        self.window_size
    }

    /// Granted bytes not spent yet
    pub fn available(&self) -> usize {
        self.granted.available_permits()
    }

    pub fn is_closed(&self) -> bool {
        self.granted.is_closed()
    }

    /// Wait until `bytes` may be sent and spend them
    pub async fn acquire(&self, bytes: usize) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        if self.window_size < 0 {
            return Ok(());
        }
        let bytes = u32::try_from(bytes.max(1)).map_err(|_| {
            CorvidError::IllegalState(format!("message of {bytes} bytes exceeds the credit range"))
        })?;
        self.top_up(bytes as i64);

        match self.granted.acquire_many(bytes).await {
            Ok(permit) => {
                permit.forget();
                Ok(())
            }
            Err(_) => Err(self.closed_error()),
        }
    }

    /// Ask for enough credit to cover `needed` bytes and keep about one
    /// window in reserve; stays quiet while more than half a window is left
    fn top_up(&self, needed: i64) {
        let request = {
            let mut pending = self.pending.lock();
            let covered = self.available() as i64 + *pending - needed;
            let window = self.window_size as i64;
            if covered >= window / 2 {
                return;
            }
            let amount = i32::try_from(window - covered).unwrap_or(i32::MAX);
            *pending += amount as i64;
            amount
        };
        trace!(address = %self.address, credits = request, "Requesting producer credits");
        self.requester.request_credits(&self.address, request);
    }

    /// The server granted `credits` more bytes
    pub fn receive(&self, credits: i32) {
        if credits <= 0 || self.is_closed() {
            return;
        }
        {
            let mut pending = self.pending.lock();
            *pending = (*pending - credits as i64).max(0);
        }
        self.granted.add_permits(credits as usize);
    }

    /// Requests sent before a failover may never be answered
    pub fn reset(&self) {
        if self.is_closed() || self.window_size < 0 {
            return;
        }
        *self.pending.lock() = 0;
        self.top_up(0);
    }

    /// Wake blocked senders with an error and drop the outstanding grant
    pub fn close(&self) {
        self.granted.close();
        *self.pending.lock() = 0;
    }

    fn closed_error(&self) -> CorvidError {
        CorvidError::ObjectClosed(format!("producer credits for {}", self.address))
    }
}

struct Entry {
    credits: Arc<ProducerCredits>,
    ref_count: usize,
}

#[derive(Default)]
struct ManagerState {
    entries: HashMap<String, Entry>,
    /// Addresses with no referencing producer, oldest first
    unreferenced: VecDeque<String>,
    closed: bool,
}

impl ManagerState {
    fn remove_unreferenced(&mut self, address: &str) {
        self.unreferenced.retain(|a| a != address);
    }

    /// Insert at the young end, evicting the oldest entry past capacity
    fn add_unreferenced(&mut self, address: &str) -> Option<Arc<ProducerCredits>> {
        self.remove_unreferenced(address);
        self.unreferenced.push_back(address.to_string());
        if self.unreferenced.len() <= MAX_UNREFERENCED_CREDITS {
            return None;
        }
        let oldest = self.unreferenced.pop_front()?;
        self.entries.remove(&oldest).map(|entry| entry.credits)
    }
}

/// The credits of every address a session sends to
pub struct ProducerCreditManager {
    window_size: i32,
    requester: Arc<dyn CreditRequester>,
    state: Mutex<ManagerState>,
}

impl std::fmt::Debug for ProducerCreditManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ProducerCreditManager")
            .field("window_size", &self.window_size)
            .field("credits", &state.entries.len())
            .field("unreferenced", &state.unreferenced.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl ProducerCreditManager {
    pub fn new(window_size: i32, requester: Arc<dyn CreditRequester>) -> Self {
        Self {
            window_size,
            requester,
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// Credits for `address`, created on first use.
    ///
    /// A named producer takes a reference; an anonymous send only refreshes
    /// the entry's place in the unreferenced cache.
    pub fn get_credits(&self, address: &str, anonymous: bool) -> Result<Arc<ProducerCredits>> {
        let (credits, created, evicted) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(CorvidError::ObjectClosed(
                    "producer credit manager".to_string(),
                ));
            }
            let mut created = false;
            let credits = match state.entries.get(address) {
                Some(entry) => Arc::clone(&entry.credits),
                None => {
                    created = true;
                    let credits = Arc::new(ProducerCredits::new(
                        address.to_string(),
                        self.window_size,
                        Arc::clone(&self.requester),
                    ));
                    state.entries.insert(
                        address.to_string(),
                        Entry {
                            credits: Arc::clone(&credits),
                            ref_count: 0,
                        },
                    );
                    credits
                }
            };

            let mut evicted = None;
            if anonymous {
                let referenced = state
                    .entries
                    .get(address)
                    .is_some_and(|entry| entry.ref_count > 0);
                if !referenced {
                    evicted = state.add_unreferenced(address);
                }
            } else {
                if let Some(entry) = state.entries.get_mut(address) {
                    entry.ref_count += 1;
                }
                state.remove_unreferenced(address);
            }
            (credits, created, evicted)
        };

        if let Some(evicted) = evicted {
            debug!(address = %evicted.address(), "Evicting unreferenced producer credits");
            evicted.close();
        }
        if created {
            credits.reset();
        }
        Ok(credits)
    }

    /// A producer of `address` closed. No-op after close.
    pub fn return_credits(&self, address: &str) {
        let evicted = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let Some(entry) = state.entries.get_mut(address) else {
                return;
            };
            if entry.ref_count == 0 {
                return;
            }
            entry.ref_count -= 1;
            if entry.ref_count > 0 {
                return;
            }
            state.add_unreferenced(address)
        };
        if let Some(evicted) = evicted {
            debug!(address = %evicted.address(), "Evicting unreferenced producer credits");
            evicted.close();
        }
    }

    /// Apply a grant; ignored when the credits are gone
    pub fn receive_credits(&self, address: &str, credits: i32) {
        let target = {
            let state = self.state.lock();
            state
                .entries
                .get(address)
                .map(|entry| Arc::clone(&entry.credits))
        };
        match target {
            Some(target) => target.receive(credits),
            None => trace!(address, credits, "Credits for unknown address ignored"),
        }
    }

    /// Re-request every window after a failover
    pub fn reset(&self) {
        let all: Vec<Arc<ProducerCredits>> = {
            let state = self.state.lock();
            state
                .entries
                .values()
                .map(|entry| Arc::clone(&entry.credits))
                .collect()
        };
        for credits in all {
            credits.reset();
        }
    }

    /// Close every credit object; later calls fail or do nothing
    pub fn close(&self) {
        let entries = {
            let mut state = self.state.lock();
            state.closed = true;
            state.unreferenced.clear();
            std::mem::take(&mut state.entries)
        };
        for (_, entry) in entries {
            entry.credits.close();
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn unreferenced_len(&self) -> usize {
        self.state.lock().unreferenced.len()
    }

    pub fn ref_count(&self, address: &str) -> usize {
        self.state
            .lock()
            .entries
            .get(address)
            .map_or(0, |entry| entry.ref_count)
    }
}
