use std::collections::BTreeMap;

use gale_core::clock::Instant;
use gale_core::{CorrelationMode, PendingRequest};

/// Outstanding requests of one session, keyed by request id.
///
/// Request ids grow with send order, so the first entry of the map is always
/// the oldest outstanding request; that is what FIFO correlation consumes.
#[derive(Debug)]
pub struct PendingRequests {
    session_id: u64,
    mode: CorrelationMode,
    requests: BTreeMap<u64, PendingRequest>,
}

impl PendingRequests {
    pub fn new(session_id: u64, mode: CorrelationMode) -> Self {
        Self {
            session_id,
            mode,
            requests: BTreeMap::new(),
        }
    }

    pub fn mode(&self) -> CorrelationMode {
        self.mode
    }

    pub fn insert(&mut self, id: u64, sent_at: Instant) {
        self.requests.insert(
            id,
            PendingRequest {
                id,
                sent_at,
                session_id: self.session_id,
            },
        );
    }

    /// Remove the request a reply belongs to.
    ///
    /// `reply_id` is the id decoded from the reply; it is ignored in FIFO mode.
    pub fn take(&mut self, reply_id: Option<u64>) -> Option<PendingRequest> {
        match self.mode {
            CorrelationMode::Embedded => reply_id.and_then(|id| self.requests.remove(&id)),
            CorrelationMode::Fifo => self.requests.pop_first().map(|(_, request)| request),
        }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Drop everything still outstanding and report how many requests were lost
    pub fn drain_lost(&mut self) -> u64 {
        let lost = self.requests.len() as u64;
        self.requests.clear();
        lost
    }
}
