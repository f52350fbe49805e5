//! Name resolution by UDP search.
//!
//! Channels waiting for a server are gathered into batches. Each batch has
//! its own retry period, which starts at the configured minimum and doubles
//! after every unanswered round up to the ceiling. Every search request sent
//! carries a fresh sequence number, and only replies quoting a number that is
//! still outstanding are accepted.
//!
//! [`Discovery`] only decides what to send and when; the socket work lives in
//! the transport.

use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use tracing::{debug, trace};

use crate::{
    messages::{AsBytes, Search, Version},
    utils::wrapping_inplace_add,
};

/// Older sequence numbers than this per channel are forgotten
const REMEMBERED_SEARCHES: usize = 8;

#[derive(Debug)]
struct PendingSearch {
    name: String,
    batch: u64,
    /// Most recent sequence numbers sent for this channel, oldest first
    search_ids: VecDeque<u32>,
}

#[derive(Debug)]
struct SearchBatch {
    id: u64,
    channels: Vec<u32>,
    period: Duration,
    next_due: Instant,
    /// Whether any round has gone out yet; new channels may still join
    sent: bool,
}

#[derive(Debug)]
pub struct Discovery {
    min_period: Duration,
    max_period: Duration,
    max_datagram_size: usize,
    pending: HashMap<u32, PendingSearch>,
    batches: Vec<SearchBatch>,
    /// Outstanding sequence numbers and the channel each was sent for
    in_flight: HashMap<u32, u32>,
    next_search_id: u32,
    next_batch_id: u64,
}

impl Discovery {
    pub fn new(min_period: Duration, max_period: Duration, max_datagram_size: usize) -> Self {
        Discovery {
            min_period,
            max_period: max_period.max(min_period),
            max_datagram_size,
            pending: HashMap::new(),
            batches: Vec::new(),
            in_flight: HashMap::new(),
            next_search_id: 1,
            next_batch_id: 0,
        }
    }

    /// Start searching for a channel. The first request goes out on the next poll.
    pub fn install(&mut self, cid: u32, name: &str, now: Instant) {
        if self.pending.contains_key(&cid) {
            return;
        }
        let index = match self.batches.iter().position(|b| !b.sent) {
            Some(index) => index,
            None => {
                let id = wrapping_inplace_add(&mut self.next_batch_id);
                self.batches.push(SearchBatch {
                    id,
                    channels: Vec::new(),
                    period: self.min_period,
                    next_due: now,
                    sent: false,
                });
                self.batches.len() - 1
            }
        };
        let batch = &mut self.batches[index];
        batch.channels.push(cid);
        debug!("Searching for '{name}' (cid {cid}) in batch {}", batch.id);
        self.pending.insert(
            cid,
            PendingSearch {
                name: name.to_string(),
                batch: batch.id,
                search_ids: VecDeque::new(),
            },
        );
    }

    /// Start searching for a channel in a batch of its own, first due at `due`
    pub fn install_deferred(&mut self, cid: u32, name: &str, due: Instant) {
        if self.pending.contains_key(&cid) {
            return;
        }
        let id = wrapping_inplace_add(&mut self.next_batch_id);
        self.batches.push(SearchBatch {
            id,
            channels: vec![cid],
            period: self.min_period,
            next_due: due,
            sent: true,
        });
        debug!("Searching for '{name}' (cid {cid}) again later");
        self.pending.insert(
            cid,
            PendingSearch {
                name: name.to_string(),
                batch: id,
                search_ids: VecDeque::new(),
            },
        );
    }

    /// Stop searching for a channel, forgetting its outstanding requests
    pub fn remove(&mut self, cid: u32) -> bool {
        let Some(pending) = self.pending.remove(&cid) else {
            return false;
        };
        for id in pending.search_ids {
            self.in_flight.remove(&id);
        }
        if let Some(batch) = self.batches.iter_mut().find(|b| b.id == pending.batch) {
            batch.channels.retain(|c| *c != cid);
        }
        self.batches.retain(|b| !b.channels.is_empty());
        true
    }

    /// Match a reply to the channel it answers.
    ///
    /// Returns `None` for sequence numbers that are unknown or no longer
    /// outstanding. An accepted reply ends the search for that channel and
    /// returns every batch to the minimum period.
    pub fn accept_reply(&mut self, search_id: u32) -> Option<u32> {
        let Some(cid) = self.in_flight.remove(&search_id) else {
            trace!("Discarding reply to unknown or stale search {search_id}");
            return None;
        };
        self.remove(cid);
        for batch in &mut self.batches {
            batch.period = self.min_period;
        }
        Some(cid)
    }

    pub fn is_searching(&self, cid: u32) -> bool {
        self.pending.contains_key(&cid)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Build the datagrams for every batch that is due, and schedule each
    /// batch's next round.
    ///
    /// Each datagram starts with a VERSION message and holds as many searches
    /// as fit in the configured datagram size.
    pub fn poll_due(&mut self, now: Instant) -> Vec<Vec<u8>> {
        let header = Version::default().as_bytes();
        let mut datagrams = Vec::new();
        let mut current = header.clone();

        for batch in self.batches.iter_mut().filter(|b| b.next_due <= now) {
            for cid in &batch.channels {
                let Some(pending) = self.pending.get_mut(cid) else {
                    continue;
                };
                let search_id = wrapping_inplace_add(&mut self.next_search_id);
                self.in_flight.insert(search_id, *cid);
                pending.search_ids.push_back(search_id);
                if pending.search_ids.len() > REMEMBERED_SEARCHES {
                    if let Some(old) = pending.search_ids.pop_front() {
                        self.in_flight.remove(&old);
                    }
                }
                let message = Search {
                    search_id,
                    channel_name: pending.name.clone(),
                    ..Default::default()
                }
                .as_bytes();
                if current.len() > header.len()
                    && current.len() + message.len() > self.max_datagram_size
                {
                    datagrams.push(std::mem::replace(&mut current, header.clone()));
                }
                current.extend_from_slice(&message);
                trace!("Search {search_id} for '{}'", pending.name);
            }
            batch.sent = true;
            batch.next_due = now + batch.period;
            batch.period = (batch.period * 2).min(self.max_period);
        }
        if current.len() > header.len() {
            datagrams.push(current);
        }
        datagrams
    }

    /// When the next batch falls due, if anything is being searched for
    pub fn next_deadline(&self) -> Option<Instant> {
        self.batches.iter().map(|b| b.next_due).min()
    }

    /// Bring every search forward to now at the minimum period
    pub fn boost(&mut self, now: Instant) {
        if !self.batches.is_empty() {
            debug!("Boosting {} pending searches", self.pending.len());
        }
        for batch in &mut self.batches {
            batch.period = self.min_period;
            batch.next_due = batch.next_due.min(now);
        }
    }
}
