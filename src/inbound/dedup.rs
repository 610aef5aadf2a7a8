//! Event deduplication and echo filtering.
//!
//! Keys are recorded at admission, not after processing, so two
//! near-simultaneous deliveries of the same event cannot both get through.
//! Records expire after `message_expiry`; a key seen again after that is
//! treated as new work.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{DedupConfig, SyntheticKeyStrategy};
use crate::inbound::event::RawInboundEvent;

const RANDOM_SUFFIX_LEN: usize = 8;

/// Why an event was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Duplicate,
    SelfOrigin,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duplicate => write!(f, "duplicate"),
            Self::SelfOrigin => write!(f, "self_origin"),
        }
    }
}

/// Result of `EventDeduplicator::admit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted { event_key: String },
    Rejected { reason: RejectReason },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }
}

/// A key currently blocking re-admission.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedEventRecord {
    pub event_key: String,
    pub processed_at: DateTime<Utc>,
}

/// Counters for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    pub admitted: u64,
    pub duplicates: u64,
    pub self_origin: u64,
    pub tracked: usize,
}

#[derive(Debug, Clone, Copy)]
struct Seen {
    at: Instant,
    wall: DateTime<Utc>,
}

#[derive(Default)]
struct DedupState {
    seen: HashMap<String, Seen>,
    /// Admission order, oldest first. May hold stale entries for keys that
    /// were forgotten or re-admitted; those are skipped on eviction.
    order: VecDeque<(String, Instant)>,
    stats: DedupStats,
}

impl DedupState {
    fn purge_expired(&mut self, now: Instant, expiry: std::time::Duration) -> usize {
        let mut purged = 0;
        while let Some((key, at)) = self.order.front() {
            if now.duration_since(*at) < expiry {
                break;
            }
            if self.seen.get(key).is_some_and(|seen| seen.at == *at) {
                self.seen.remove(key);
                purged += 1;
            }
            self.order.pop_front();
        }
        purged
    }

    fn evict_oldest(&mut self) {
        while let Some((key, at)) = self.order.pop_front() {
            if self.seen.get(&key).is_some_and(|seen| seen.at == at) {
                self.seen.remove(&key);
                tracing::debug!(event_key = %key, "Evicted oldest dedup record (capacity)");
                return;
            }
        }
    }
}

/// Rejects re-deliveries of the same inbound event and the system's own echoes.
pub struct EventDeduplicator {
    config: DedupConfig,
    state: Mutex<DedupState>,
}

impl EventDeduplicator {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            state: Mutex::new(DedupState::default()),
        }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Decide whether `event` is new work.
    pub fn admit(&self, event: &RawInboundEvent) -> Admission {
        if self.is_self_origin(event) {
            self.state.lock().stats.self_origin += 1;
            tracing::debug!(
                channel = %event.channel,
                sender = event.sender.as_deref().unwrap_or(""),
                "Dropped self-originated event"
            );
            return Admission::Rejected {
                reason: RejectReason::SelfOrigin,
            };
        }

        let event_key = self.event_key(event);
        let now = Instant::now();

        let mut state = self.state.lock();
        state.purge_expired(now, self.config.message_expiry);

        if let Some(seen) = state.seen.get(&event_key)
            && now.duration_since(seen.at) < self.config.message_expiry
        {
            state.stats.duplicates += 1;
            drop(state);
            tracing::debug!(event_key = %event_key, "Dropped duplicate event");
            return Admission::Rejected {
                reason: RejectReason::Duplicate,
            };
        }

        while state.seen.len() >= self.config.max_tracked_events.max(1) {
            state.evict_oldest();
        }

        state.seen.insert(
            event_key.clone(),
            Seen {
                at: now,
                wall: Utc::now(),
            },
        );
        state.order.push_back((event_key.clone(), now));
        state.stats.admitted += 1;

        Admission::Admitted { event_key }
    }

    /// Drop a record so the same key may be admitted again.
    pub fn forget(&self, event_key: &str) -> bool {
        self.state.lock().seen.remove(event_key).is_some()
    }

    /// Whether `event_key` currently blocks re-admission.
    pub fn contains(&self, event_key: &str) -> bool {
        let state = self.state.lock();
        state
            .seen
            .get(event_key)
            .is_some_and(|seen| seen.at.elapsed() < self.config.message_expiry)
    }

    /// Remove expired records. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let purged = self
            .state
            .lock()
            .purge_expired(Instant::now(), self.config.message_expiry);
        if purged > 0 {
            tracing::debug!(count = purged, "Purged expired dedup records");
        }
        purged
    }

    /// Live records, oldest first.
    pub fn records(&self) -> Vec<ProcessedEventRecord> {
        let state = self.state.lock();
        let mut records: Vec<ProcessedEventRecord> = state
            .seen
            .iter()
            .filter(|(_, seen)| seen.at.elapsed() < self.config.message_expiry)
            .map(|(key, seen)| ProcessedEventRecord {
                event_key: key.clone(),
                processed_at: seen.wall,
            })
            .collect();
        records.sort_by_key(|r| r.processed_at);
        records
    }

    pub fn stats(&self) -> DedupStats {
        let state = self.state.lock();
        DedupStats {
            tracked: state.seen.len(),
            ..state.stats.clone()
        }
    }

    /// Forget everything, counters included.
    pub fn clear(&self) {
        *self.state.lock() = DedupState::default();
    }

    fn is_self_origin(&self, event: &RawInboundEvent) -> bool {
        if event.from_me {
            return true;
        }
        let Some(sender) = event.sender() else {
            return false;
        };
        self.config
            .self_identities
            .iter()
            .any(|own| own.trim().eq_ignore_ascii_case(&sender))
    }

    /// Stable identity for `event`.
    ///
    /// Native ids are used as-is (scoped by channel). Without one the key is
    /// synthesized according to the configured strategy.
    pub fn event_key(&self, event: &RawInboundEvent) -> String {
        if let Some(id) = event
            .message_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        {
            return scoped(&event.channel, id);
        }

        let sender = event.sender().unwrap_or_default();
        match (self.config.synthetic_keys, event.timestamp) {
            (SyntheticKeyStrategy::ContentHash, Some(timestamp)) => {
                let mut hasher = Sha256::new();
                hasher.update(event.channel.as_bytes());
                hasher.update([0u8]);
                hasher.update(sender.as_bytes());
                hasher.update([0u8]);
                hasher.update(timestamp.to_be_bytes());
                hasher.update([0u8]);
                hasher.update(event.body.as_deref().unwrap_or_default().as_bytes());
                scoped(&event.channel, &format!("sha256:{:x}", hasher.finalize()))
            }
            _ => {
                let timestamp = event
                    .timestamp
                    .unwrap_or_else(|| Utc::now().timestamp_millis());
                let suffix: String = rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .take(RANDOM_SUFFIX_LEN)
                    .map(char::from)
                    .collect();
                scoped(&event.channel, &format!("{sender}:{timestamp}:{suffix}"))
            }
        }
    }
}

fn scoped(channel: &str, key: &str) -> String {
    if channel.is_empty() {
        key.to_string()
    } else {
        format!("{channel}:{key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(expiry_ms: u64) -> DedupConfig {
        DedupConfig {
            message_expiry: Duration::from_millis(expiry_ms),
            self_identities: vec!["+15550000".into()],
            ..DedupConfig::default()
        }
    }

    fn event(id: Option<&str>, sender: &str) -> RawInboundEvent {
        RawInboundEvent {
            message_id: id.map(str::to_string),
            channel: "whatsapp".into(),
            sender: Some(sender.into()),
            timestamp: Some(1_700_000_000),
            body: Some("hello".into()),
            ..Default::default()
        }
    }

    #[test]
    fn admits_first_rejects_repeat() {
        let dedup = EventDeduplicator::new(config(60_000));
        let e = event(Some("ABC"), "+15551234");

        assert_eq!(
            dedup.admit(&e),
            Admission::Admitted {
                event_key: "whatsapp:ABC".into()
            }
        );
        assert_eq!(
            dedup.admit(&e),
            Admission::Rejected {
                reason: RejectReason::Duplicate
            }
        );

        let stats = dedup.stats();
        assert_eq!(stats.admitted, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.tracked, 1);
    }

    #[test]
    fn readmits_after_expiry() {
        let dedup = EventDeduplicator::new(config(20));
        let e = event(Some("ABC"), "+15551234");
        assert!(dedup.admit(&e).is_admitted());
        std::thread::sleep(Duration::from_millis(40));
        assert!(dedup.admit(&e).is_admitted());
    }

    #[test]
    fn filters_self_origin() {
        let dedup = EventDeduplicator::new(config(60_000));

        let own = event(Some("1"), "+15550000");
        assert_eq!(
            dedup.admit(&own),
            Admission::Rejected {
                reason: RejectReason::SelfOrigin
            }
        );

        let flagged = RawInboundEvent {
            from_me: true,
            ..event(Some("2"), "+15551234")
        };
        assert!(!dedup.admit(&flagged).is_admitted());
        assert_eq!(dedup.stats().self_origin, 2);
        assert_eq!(dedup.stats().tracked, 0);
    }

    #[test]
    fn random_keys_never_collide() {
        let dedup = EventDeduplicator::new(config(60_000));
        let e = event(None, "+15551234");
        assert!(dedup.admit(&e).is_admitted());
        assert!(dedup.admit(&e).is_admitted());
    }

    #[test]
    fn content_hash_keys_detect_duplicates() {
        let dedup = EventDeduplicator::new(DedupConfig {
            synthetic_keys: SyntheticKeyStrategy::ContentHash,
            ..config(60_000)
        });
        let e = event(None, "+15551234");
        assert!(dedup.admit(&e).is_admitted());
        assert!(!dedup.admit(&e).is_admitted());

        let other = RawInboundEvent {
            body: Some("something else".into()),
            ..event(None, "+15551234")
        };
        assert!(dedup.admit(&other).is_admitted());
    }

    #[test]
    fn forget_allows_readmission() {
        let dedup = EventDeduplicator::new(config(60_000));
        let e = event(Some("X"), "+15551234");
        assert!(dedup.admit(&e).is_admitted());
        assert!(dedup.forget("whatsapp:X"));
        assert!(!dedup.contains("whatsapp:X"));
        assert!(dedup.admit(&e).is_admitted());
    }

    #[test]
    fn capacity_evicts_oldest() {
        let dedup = EventDeduplicator::new(DedupConfig {
            max_tracked_events: 2,
            ..config(60_000)
        });
        for id in ["a", "b", "c"] {
            assert!(dedup.admit(&event(Some(id), "+15551234")).is_admitted());
        }
        assert!(!dedup.contains("whatsapp:a"));
        assert!(dedup.contains("whatsapp:b"));
        assert!(dedup.contains("whatsapp:c"));
        assert_eq!(dedup.records().len(), 2);
    }

    #[test]
    fn purge_removes_expired_records() {
        let dedup = EventDeduplicator::new(config(10));
        dedup.admit(&event(Some("a"), "+15551234"));
        dedup.admit(&event(Some("b"), "+15551234"));
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(dedup.purge_expired(), 2);
        assert_eq!(dedup.stats().tracked, 0);
    }
}
