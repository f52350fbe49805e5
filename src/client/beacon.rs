//! Tracking of server beacons.
//!
//! Servers announce themselves periodically over UDP. The tracker keeps a
//! running estimate of each server's beacon period, and reports when beacons
//! arrive out of pattern: a gap much longer than usual means the route to the
//! server was lost and restored, a gap much shorter means the server has just
//! restarted. Either is a hint to look at circuits and searches again.

use std::{
    net::SocketAddr,
    num::NonZeroUsize,
    time::{Duration, Instant},
};

use lru::LruCache;
use tracing::trace;

use crate::messages::BEACON_SEQUENCE_MINOR_VERSION;

/// A gap this many times the average counts as a missed beacon
const ANOMALY_FACTOR: f64 = 1.25;
/// A gap this many times the average means the network changed underneath us
const NET_CHANGE_FACTOR: f64 = 3.25;
/// A gap this short means the server restarted
const RESTART_FACTOR: f64 = 0.80;
/// Weight of the newest period in the running average
const AVERAGE_WEIGHT: f64 = 0.125;
/// Sequence numbers this close behind the last one are duplicates
const SEQUENCE_BACKTRACK_WINDOW: u32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconVerdict {
    /// First beacon from a server not seen before
    First,
    /// A duplicate or out of order beacon, which changes nothing
    Discarded,
    /// Arrived on schedule
    Regular,
    /// Arrived out of pattern; connected circuits should be sent an echo
    Anomaly { net_change: bool },
}

#[derive(Debug, Clone, Default)]
struct BeaconEntry {
    last_seen: Option<Instant>,
    average_period: Option<Duration>,
    last_sequence: Option<u32>,
    /// Whether a circuit to this server currently exists
    has_circuit: bool,
}

#[derive(Debug)]
pub struct BeaconTracker {
    entries: LruCache<SocketAddr, BeaconEntry>,
    started: Instant,
}

impl BeaconTracker {
    pub fn new(capacity: usize, started: Instant) -> Self {
        BeaconTracker {
            entries: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
            started,
        }
    }

    pub fn beacon_received(
        &mut self,
        address: SocketAddr,
        sequence: u32,
        minor_version: u16,
        now: Instant,
    ) -> BeaconVerdict {
        let sequenced = minor_version >= BEACON_SEQUENCE_MINOR_VERSION;
        let Some(entry) = self.entries.get_mut(&address) else {
            trace!("First beacon from {address}");
            self.entries.put(
                address,
                BeaconEntry {
                    last_seen: Some(now),
                    last_sequence: sequenced.then_some(sequence),
                    ..Default::default()
                },
            );
            return BeaconVerdict::First;
        };

        // Entry made for a circuit before any beacon arrived
        let Some(last_seen) = entry.last_seen else {
            entry.last_seen = Some(now);
            entry.last_sequence = sequenced.then_some(sequence);
            return BeaconVerdict::Anomaly { net_change: false };
        };

        if sequenced {
            let previous = entry.last_sequence.replace(sequence);
            if let Some(previous) = previous {
                let advance = if sequence >= previous {
                    sequence - previous
                } else {
                    (u32::MAX - previous) + sequence
                };
                if advance == 0
                    || advance > u32::MAX - SEQUENCE_BACKTRACK_WINDOW
                    || (2..4).contains(&advance)
                {
                    trace!("Discarding beacon {sequence} from {address} (advance {advance})");
                    return BeaconVerdict::Discarded;
                }
            }
        }

        let current = now.saturating_duration_since(last_seen);
        let verdict = match entry.average_period {
            None => {
                entry.average_period = Some(current);
                // Only a server that appeared after we started counts as new
                BeaconVerdict::Anomaly {
                    net_change: current <= last_seen.saturating_duration_since(self.started),
                }
            }
            Some(average) => {
                let verdict = if current >= average.mul_f64(ANOMALY_FACTOR) {
                    BeaconVerdict::Anomaly {
                        net_change: current >= average.mul_f64(NET_CHANGE_FACTOR),
                    }
                } else if current <= average.mul_f64(RESTART_FACTOR) {
                    BeaconVerdict::Anomaly { net_change: true }
                } else {
                    BeaconVerdict::Regular
                };
                entry.average_period =
                    Some(current.mul_f64(AVERAGE_WEIGHT) + average.mul_f64(1.0 - AVERAGE_WEIGHT));
                verdict
            }
        };
        entry.last_seen = Some(now);
        verdict
    }

    pub fn period(&self, address: &SocketAddr) -> Option<Duration> {
        self.entries.peek(address)?.average_period
    }

    pub fn last_seen(&self, address: &SocketAddr) -> Option<Instant> {
        self.entries.peek(address)?.last_seen
    }

    /// Has the server gone quiet for longer than `multiplier` beacon periods?
    ///
    /// Without a period estimate there is nothing to judge by, so no.
    pub fn is_silent(&self, address: &SocketAddr, multiplier: f64, now: Instant) -> bool {
        let Some(entry) = self.entries.peek(address) else {
            return false;
        };
        match (entry.last_seen, entry.average_period) {
            (Some(last_seen), Some(period)) => {
                now.saturating_duration_since(last_seen) > period.mul_f64(multiplier)
            }
            _ => false,
        }
    }

    pub fn has_circuit(&self, address: &SocketAddr) -> bool {
        self.entries
            .peek(address)
            .map(|e| e.has_circuit)
            .unwrap_or(false)
    }

    pub fn register_circuit(&mut self, address: SocketAddr) {
        if let Some(entry) = self.entries.get_mut(&address) {
            entry.has_circuit = true;
        } else {
            self.entries.put(
                address,
                BeaconEntry {
                    has_circuit: true,
                    ..Default::default()
                },
            );
        }
    }

    /// Forget the history of a server whose circuit went away, so that it is
    /// judged afresh when it reappears.
    pub fn unregister_circuit(&mut self, address: &SocketAddr) {
        if let Some(entry) = self.entries.get_mut(address) {
            if entry.has_circuit {
                *entry = BeaconEntry {
                    last_sequence: entry.last_sequence,
                    ..Default::default()
                };
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "10.0.0.1:5064".parse().unwrap()
    }

    #[test]
    fn period_estimate() {
        let start = Instant::now();
        let mut tracker = BeaconTracker::new(16, start);
        let period = Duration::from_secs(15);
        let mut now = start + Duration::from_secs(1);
        assert_eq!(
            tracker.beacon_received(addr(), 1, 13, now),
            BeaconVerdict::First
        );
        now += period;
        // Seen within one period of starting, so it was already up
        assert_eq!(
            tracker.beacon_received(addr(), 2, 13, now),
            BeaconVerdict::Anomaly { net_change: false }
        );
        assert_eq!(tracker.period(&addr()), Some(period));
        for seq in 3..10 {
            now += period;
            assert_eq!(
                tracker.beacon_received(addr(), seq, 13, now),
                BeaconVerdict::Regular
            );
        }
        assert_eq!(tracker.last_seen(&addr()), Some(now));
        assert!(!tracker.is_silent(&addr(), 3.25, now + period * 3));
        assert!(tracker.is_silent(&addr(), 3.25, now + period * 4));
    }

    #[test]
    fn anomalies() {
        let start = Instant::now();
        let mut tracker = BeaconTracker::new(16, start);
        let period = Duration::from_secs(10);
        let mut now = start + Duration::from_secs(60);
        tracker.beacon_received(addr(), 1, 13, now);
        now += period;
        tracker.beacon_received(addr(), 2, 13, now);
        // One missed beacon
        now += period * 2;
        assert_eq!(
            tracker.beacon_received(addr(), 3, 12, now),
            BeaconVerdict::Anomaly { net_change: false }
        );
        // A long outage
        now += period * 6;
        assert_eq!(
            tracker.beacon_received(addr(), 4, 12, now),
            BeaconVerdict::Anomaly { net_change: true }
        );
        // A restarted server beacons fast
        now += Duration::from_millis(100);
        assert_eq!(
            tracker.beacon_received(addr(), 1, 9, now),
            BeaconVerdict::Anomaly { net_change: true }
        );
    }

    #[test]
    fn new_server_after_startup_is_a_net_change() {
        let start = Instant::now();
        let mut tracker = BeaconTracker::new(16, start);
        // First heard from long after we started
        let now = start + Duration::from_secs(30);
        tracker.beacon_received(addr(), 1, 13, now);
        assert_eq!(
            tracker.beacon_received(addr(), 2, 13, now + Duration::from_secs(1)),
            BeaconVerdict::Anomaly { net_change: true }
        );
    }

    #[test]
    fn duplicate_sequences_are_discarded() {
        let start = Instant::now();
        let mut tracker = BeaconTracker::new(16, start);
        let mut now = start;
        tracker.beacon_received(addr(), 100, 13, now);
        now += Duration::from_secs(1);
        assert_eq!(
            tracker.beacon_received(addr(), 100, 13, now),
            BeaconVerdict::Discarded
        );
        assert_eq!(
            tracker.beacon_received(addr(), 99, 13, now),
            BeaconVerdict::Discarded
        );
        assert_eq!(
            tracker.beacon_received(addr(), 102, 13, now),
            BeaconVerdict::Discarded
        );
        assert_ne!(
            tracker.beacon_received(addr(), 103, 13, now),
            BeaconVerdict::Discarded
        );
        // Old servers don't number their beacons
        assert_ne!(
            tracker.beacon_received(addr(), 0, 9, now + Duration::from_secs(1)),
            BeaconVerdict::Discarded
        );
    }

    #[test]
    fn unregister_resets_history() {
        let start = Instant::now();
        let mut tracker = BeaconTracker::new(16, start);
        tracker.register_circuit(addr());
        assert!(tracker.has_circuit(&addr()));
        assert_eq!(
            tracker.beacon_received(addr(), 1, 13, start),
            BeaconVerdict::Anomaly { net_change: false }
        );
        tracker.beacon_received(addr(), 2, 13, start + Duration::from_secs(5));
        assert!(tracker.period(&addr()).is_some());
        tracker.unregister_circuit(&addr());
        assert!(!tracker.has_circuit(&addr()));
        assert_eq!(tracker.period(&addr()), None);
        assert_eq!(tracker.last_seen(&addr()), None);
    }

    #[test]
    fn table_is_bounded() {
        let mut tracker = BeaconTracker::new(2, Instant::now());
        for i in 0..5u16 {
            let address = SocketAddr::from(([10, 0, 0, 1], 5000 + i));
            tracker.beacon_received(address, 1, 13, Instant::now());
        }
        assert_eq!(tracker.len(), 2);
    }
}
