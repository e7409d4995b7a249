use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

/// `[first_seen, last_seen]` span of continuous-enough presence of one person.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceInterval {
    pub person: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub open: bool,
}

/// A mutation applied by the tracker, mirrored into the presence store by
/// the capture path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    Opened {
        person: String,
        at: DateTime<Utc>,
    },
    Extended {
        person: String,
        at: DateTime<Utc>,
    },
    Closed {
        person: String,
        first_seen: DateTime<Utc>,
        last_seen: DateTime<Utc>,
    },
}

impl PresenceChange {
    pub fn person(&self) -> &str {
        match self {
            Self::Opened { person, .. }
            | Self::Extended { person, .. }
            | Self::Closed { person, .. } => person,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("identity {0:?} is not a registered person")]
    UnknownIdentity(String),
}

#[derive(Debug, Clone, Copy, Default)]
enum PersonState {
    #[default]
    Absent,
    Present {
        first_seen: DateTime<Utc>,
        last_seen: DateTime<Utc>,
    },
}

/// Closed intervals kept in memory per person. Older ones live only in the
/// presence store.
pub const CLOSED_HISTORY: usize = 32;

/// Per-person state plus its most recent closed intervals, oldest first.
#[derive(Debug, Default)]
struct PersonLog {
    state: PersonState,
    closed: VecDeque<(DateTime<Utc>, DateTime<Utc>)>,
}

impl PersonLog {
    fn record(
        &mut self,
        person: &str,
        at: DateTime<Utc>,
        timeout: Option<Duration>,
    ) -> Vec<PresenceChange> {
        match self.state {
            PersonState::Absent => {
                self.state = PersonState::Present {
                    first_seen: at,
                    last_seen: at,
                };
                vec![PresenceChange::Opened {
                    person: person.to_string(),
                    at,
                }]
            }
            PersonState::Present {
                first_seen,
                last_seen,
            } => {
                if at <= last_seen {
                    // Out-of-order or duplicate detection: last_seen never regresses.
                    return Vec::new();
                }
                if exceeds(timeout, last_seen, at) {
                    let closed = self.close(person, first_seen, last_seen);
                    self.state = PersonState::Present {
                        first_seen: at,
                        last_seen: at,
                    };
                    return vec![
                        closed,
                        PresenceChange::Opened {
                            person: person.to_string(),
                            at,
                        },
                    ];
                }
                self.state = PersonState::Present {
                    first_seen,
                    last_seen: at,
                };
                vec![PresenceChange::Extended {
                    person: person.to_string(),
                    at,
                }]
            }
        }
    }

    fn close_if_idle(
        &mut self,
        person: &str,
        now: DateTime<Utc>,
        timeout: Option<Duration>,
    ) -> Option<PresenceChange> {
        let PersonState::Present {
            first_seen,
            last_seen,
        } = self.state
        else {
            return None;
        };
        if !exceeds(timeout, last_seen, now) {
            return None;
        }
        let change = self.close(person, first_seen, last_seen);
        self.state = PersonState::Absent;
        Some(change)
    }

    fn close(
        &mut self,
        person: &str,
        first_seen: DateTime<Utc>,
        last_seen: DateTime<Utc>,
    ) -> PresenceChange {
        if self.closed.len() == CLOSED_HISTORY {
            self.closed.pop_front();
        }
        self.closed.push_back((first_seen, last_seen));
        PresenceChange::Closed {
            person: person.to_string(),
            first_seen,
            last_seen,
        }
    }

    fn intervals(&self, person: &str, out: &mut Vec<PresenceInterval>) {
        out.extend(self.closed.iter().map(|&(first_seen, last_seen)| PresenceInterval {
            person: person.to_string(),
            first_seen,
            last_seen,
            open: false,
        }));
        if let PersonState::Present {
            first_seen,
            last_seen,
        } = self.state
        {
            out.push(PresenceInterval {
                person: person.to_string(),
                first_seen,
                last_seen,
                open: true,
            });
        }
    }
}

/// Gap strictly greater than the timeout closes the interval.
fn exceeds(timeout: Option<Duration>, last_seen: DateTime<Utc>, at: DateTime<Utc>) -> bool {
    let Some(timeout) = timeout else {
        return false;
    };
    match (at - last_seen).to_std() {
        Ok(gap) => gap > timeout,
        Err(_) => false,
    }
}

/// Turns per-frame "person seen at T" events into presence intervals.
///
/// Each registered person has its own lock, so detections of unrelated
/// people never contend. The registry lock is only taken for writing when
/// the set of known persons changes (after a retrain).
pub struct PresenceTracker {
    persons: RwLock<BTreeMap<String, Arc<Mutex<PersonLog>>>>,
    session_timeout: Option<Duration>,
}

impl PresenceTracker {
    /// `session_timeout` of zero disables closing: an interval then spans
    /// the whole process lifetime.
    pub fn new<I, S>(known_persons: I, session_timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let persons = known_persons
            .into_iter()
            .map(|name| (name.into(), Arc::new(Mutex::new(PersonLog::default()))))
            .collect();
        Self {
            persons: RwLock::new(persons),
            session_timeout: (!session_timeout.is_zero()).then_some(session_timeout),
        }
    }

    /// Add any persons not yet known. Existing state is kept.
    pub fn register<I, S>(&self, names: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut persons = self.persons.write().expect("presence registry poisoned");
        let mut added = 0;
        for name in names {
            let name = name.into();
            if !persons.contains_key(&name) {
                info!(person = name, "registered person");
                persons.insert(name, Arc::new(Mutex::new(PersonLog::default())));
                added += 1;
            }
        }
        added
    }

    pub fn known_persons(&self) -> Vec<String> {
        let persons = self.persons.read().expect("presence registry poisoned");
        persons.keys().cloned().collect()
    }

    /// Record one detection of `person` at `at`.
    ///
    /// Returns the changes applied, empty when the detection was older than
    /// the current `last_seen`.
    pub fn record(
        &self,
        person: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<PresenceChange>, PresenceError> {
        let entry = {
            let persons = self.persons.read().expect("presence registry poisoned");
            persons.get(person).cloned()
        }
        .ok_or_else(|| PresenceError::UnknownIdentity(person.to_string()))?;

        let mut log = entry.lock().expect("person presence lock poisoned");
        let changes = log.record(person, at, self.session_timeout);
        debug!(person, changes = changes.len(), "recorded detection");
        Ok(changes)
    }

    /// Close every open interval whose `last_seen` is older than the session
    /// timeout relative to `now`.
    pub fn close_idle(&self, now: DateTime<Utc>) -> Vec<PresenceChange> {
        if self.session_timeout.is_none() {
            return Vec::new();
        }
        let entries = self.entries();
        let mut changes = Vec::new();
        for (person, entry) in &entries {
            let mut log = entry.lock().expect("person presence lock poisoned");
            if let Some(change) = log.close_if_idle(person, now, self.session_timeout) {
                info!(person, "presence interval closed after idle timeout");
                changes.push(change);
            }
        }
        changes
    }

    /// Consistent point-in-time view of every open interval and the last
    /// [`CLOSED_HISTORY`] closed ones per person, ordered by `first_seen`
    /// then person.
    pub fn snapshot(&self) -> Vec<PresenceInterval> {
        let entries = self.entries();
        // Hold every person lock at once; acquisition follows name order.
        let guards: Vec<_> = entries
            .iter()
            .map(|(person, entry)| {
                (
                    person.as_str(),
                    entry.lock().expect("person presence lock poisoned"),
                )
            })
            .collect();

        let mut intervals = Vec::new();
        for (person, log) in &guards {
            log.intervals(person, &mut intervals);
        }
        drop(guards);

        intervals.sort_by(|a, b| {
            a.first_seen
                .cmp(&b.first_seen)
                .then_with(|| a.person.cmp(&b.person))
        });
        intervals
    }

    fn entries(&self) -> Vec<(String, Arc<Mutex<PersonLog>>)> {
        let persons = self.persons.read().expect("presence registry poisoned");
        persons
            .iter()
            .map(|(name, entry)| (name.clone(), Arc::clone(entry)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::thread;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn tracker(timeout_secs: u64) -> PresenceTracker {
        PresenceTracker::new(["alice", "bob"], Duration::from_secs(timeout_secs))
    }

    #[test]
    fn consecutive_detections_form_one_interval() {
        let tracker = tracker(600);
        for s in 0..=2 {
            tracker.record("alice", t(s)).unwrap();
        }
        let snapshot = tracker.snapshot();
        assert_eq!(
            snapshot,
            vec![PresenceInterval {
                person: "alice".into(),
                first_seen: t(0),
                last_seen: t(2),
                open: true,
            }]
        );
    }

    #[test]
    fn first_detection_opens_then_extends() {
        let tracker = tracker(600);
        let opened = tracker.record("bob", t(5)).unwrap();
        assert_eq!(
            opened,
            vec![PresenceChange::Opened {
                person: "bob".into(),
                at: t(5)
            }]
        );
        let extended = tracker.record("bob", t(6)).unwrap();
        assert_eq!(
            extended,
            vec![PresenceChange::Extended {
                person: "bob".into(),
                at: t(6)
            }]
        );
    }

    #[test]
    fn older_timestamp_does_not_regress_last_seen() {
        let tracker = tracker(600);
        tracker.record("alice", t(0)).unwrap();
        tracker.record("alice", t(10)).unwrap();
        assert!(tracker.record("alice", t(4)).unwrap().is_empty());
        assert!(tracker.record("alice", t(10)).unwrap().is_empty());

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].last_seen, t(10));
    }

    #[test]
    fn unknown_identity_is_rejected() {
        let tracker = tracker(600);
        let err = tracker.record("mallory", t(0)).unwrap_err();
        assert!(matches!(err, PresenceError::UnknownIdentity(name) if name == "mallory"));
        assert!(tracker.snapshot().is_empty());
    }

    #[test]
    fn gap_beyond_timeout_closes_and_reopens() {
        let tracker = tracker(30);
        tracker.record("alice", t(0)).unwrap();
        tracker.record("alice", t(20)).unwrap();
        let changes = tracker.record("alice", t(100)).unwrap();
        assert_eq!(changes.len(), 2);
        assert!(matches!(changes[0], PresenceChange::Closed { .. }));
        assert!(matches!(changes[1], PresenceChange::Opened { .. }));

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!((snapshot[0].first_seen, snapshot[0].last_seen), (t(0), t(20)));
        assert!(!snapshot[0].open);
        assert_eq!((snapshot[1].first_seen, snapshot[1].last_seen), (t(100), t(100)));
        assert!(snapshot[1].open);
    }

    #[test]
    fn close_idle_sweeps_only_stale_persons() {
        let tracker = tracker(30);
        tracker.record("alice", t(0)).unwrap();
        tracker.record("bob", t(50)).unwrap();

        let changes = tracker.close_idle(t(60));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].person(), "alice");

        let open: Vec<_> = tracker
            .snapshot()
            .into_iter()
            .filter(|i| i.open)
            .map(|i| i.person)
            .collect();
        assert_eq!(open, vec!["bob".to_string()]);

        // Alice comes back: a fresh interval.
        tracker.record("alice", t(70)).unwrap();
        let alice: Vec<_> = tracker
            .snapshot()
            .into_iter()
            .filter(|i| i.person == "alice")
            .collect();
        assert_eq!(alice.len(), 2);
    }

    #[test]
    fn zero_timeout_never_closes() {
        let tracker = tracker(0);
        tracker.record("alice", t(0)).unwrap();
        tracker.record("alice", t(100_000)).unwrap();
        assert!(tracker.close_idle(t(1_000_000)).is_empty());
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!((snapshot[0].first_seen, snapshot[0].last_seen), (t(0), t(100_000)));
    }

    #[test]
    fn register_adds_new_persons_and_keeps_state() {
        let tracker = tracker(600);
        tracker.record("alice", t(0)).unwrap();
        assert_eq!(tracker.register(["alice", "carol"]), 1);
        assert_eq!(tracker.known_persons(), vec!["alice", "bob", "carol"]);
        tracker.record("carol", t(1)).unwrap();
        assert_eq!(tracker.snapshot().len(), 2);
    }

    #[test]
    fn concurrent_records_on_distinct_persons_lose_nothing() {
        let names: Vec<String> = (0..8).map(|i| format!("person-{i}")).collect();
        let tracker = Arc::new(PresenceTracker::new(
            names.clone(),
            Duration::from_secs(600),
        ));

        let handles: Vec<_> = names
            .iter()
            .cloned()
            .map(|name| {
                let tracker = Arc::clone(&tracker);
                thread::spawn(move || {
                    for s in 0..200 {
                        tracker.record(&name, t(s)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.len(), names.len());
        for interval in snapshot {
            assert_eq!(interval.first_seen, t(0));
            assert_eq!(interval.last_seen, t(199));
            assert!(interval.open);
        }
    }

    #[test]
    fn concurrent_records_on_one_person_keep_max_last_seen() {
        let tracker = Arc::new(tracker(600));
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let tracker = Arc::clone(&tracker);
                thread::spawn(move || {
                    for s in (worker..400).step_by(4) {
                        tracker.record("alice", t(s)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].last_seen, t(399));
        assert!(snapshot[0].first_seen <= snapshot[0].last_seen);
    }

    #[test]
    fn closed_history_is_bounded_per_person() {
        let tracker = tracker(5);
        let sessions = CLOSED_HISTORY as i64 + 8;
        for n in 0..=sessions {
            tracker.record("alice", t(n * 100)).unwrap();
        }
        tracker.record("bob", t(0)).unwrap();
        tracker.record("bob", t(100)).unwrap();

        let alice: Vec<_> = tracker
            .snapshot()
            .into_iter()
            .filter(|i| i.person == "alice")
            .collect();
        assert_eq!(alice.len(), CLOSED_HISTORY + 1);
        assert!(alice.last().unwrap().open);
        assert_eq!(alice.last().unwrap().first_seen, t(sessions * 100));
        // The oldest sessions were evicted, the newest closed one kept.
        assert_eq!(alice[0].first_seen, t((sessions - CLOSED_HISTORY as i64) * 100));
        assert_eq!(alice[CLOSED_HISTORY - 1].first_seen, t((sessions - 1) * 100));

        let bob = tracker.snapshot().into_iter().filter(|i| i.person == "bob").count();
        assert_eq!(bob, 2);
    }
}
