use crate::models::{FetchState, FinishedFileStat, LazyLoadStats, LoadingFileStat};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Loading,
    Completed,
    Failed(String),
}

impl FetchOutcome {
    pub fn state(&self) -> FetchState {
        match self {
            Self::Loading => FetchState::Loading,
            Self::Completed => FetchState::Completed,
            Self::Failed(_) => FetchState::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }
}

#[derive(Debug)]
pub struct FetchRecord {
    pub key: String,
    pub state: FetchState,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: Option<u64>,
    started: Instant,
    generation: u64,
    signal: watch::Sender<FetchOutcome>,
}

impl FetchRecord {
    fn outcome(&self) -> FetchOutcome {
        match self.state {
            FetchState::Loading => FetchOutcome::Loading,
            FetchState::Completed => FetchOutcome::Completed,
            FetchState::Failed => FetchOutcome::Failed(self.error.clone().unwrap_or_default()),
        }
    }
}

pub enum Lookup {
    Absent,
    Loading(watch::Receiver<FetchOutcome>),
    Finished(FetchOutcome),
}

pub enum Admission {
    Admitted {
        generation: u64,
        receiver: watch::Receiver<FetchOutcome>,
    },
    Joined(watch::Receiver<FetchOutcome>),
    Finished(FetchOutcome),
}

/// Fetch state per normalized key. Every record mutation happens under the
/// write lock; waiters hold only a receiver, never the record.
#[derive(Debug, Default)]
pub struct StatusPool {
    records: RwLock<HashMap<String, FetchRecord>>,
    next_generation: AtomicU64,
}

impl StatusPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, FetchRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, FetchRecord>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lookup(&self, key: &str) -> Lookup {
        let records = self.read();
        match records.get(key) {
            None => Lookup::Absent,
            Some(record) if record.state == FetchState::Loading => Lookup::Loading(record.signal.subscribe()),
            Some(record) => Lookup::Finished(record.outcome()),
        }
    }

    /// Re-validates under the exclusive lock before creating a record, so two
    /// callers that both saw `Absent` cannot both be admitted.
    pub fn admit(&self, key: &str) -> Admission {
        let mut records = self.write();
        if let Some(record) = records.get(key) {
            return if record.state == FetchState::Loading {
                Admission::Joined(record.signal.subscribe())
            } else {
                Admission::Finished(record.outcome())
            };
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (signal, receiver) = watch::channel(FetchOutcome::Loading);
        records.insert(
            key.to_string(),
            FetchRecord {
                key: key.to_string(),
                state: FetchState::Loading,
                error: None,
                started_at: Utc::now(),
                elapsed_ms: None,
                started: Instant::now(),
                generation,
                signal,
            },
        );
        Admission::Admitted { generation, receiver }
    }

    /// Latches the terminal state and fans it out to every waiter. Returns the
    /// elapsed time, or `None` when the record was replaced or is gone.
    pub fn finish(&self, key: &str, generation: u64, result: Result<(), String>) -> Option<u64> {
        let mut records = self.write();
        let record = records.get_mut(key).filter(|record| record.generation == generation)?;
        if record.state.is_terminal() {
            return record.elapsed_ms;
        }

        let elapsed_ms = record.started.elapsed().as_millis() as u64;
        let outcome = match result {
            Ok(()) => {
                record.state = FetchState::Completed;
                record.error = None;
                FetchOutcome::Completed
            }
            Err(error) => {
                record.state = FetchState::Failed;
                record.error = Some(error.clone());
                FetchOutcome::Failed(error)
            }
        };
        record.elapsed_ms = Some(elapsed_ms);
        record.signal.send_replace(outcome);
        Some(elapsed_ms)
    }

    pub fn remove_if_generation(&self, key: &str, generation: u64) -> bool {
        let mut records = self.write();
        match records.get(key) {
            Some(record) if record.generation == generation => {
                records.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn clear_terminal(&self) -> usize {
        let mut records = self.write();
        let before = records.len();
        records.retain(|_, record| !record.state.is_terminal());
        before - records.len()
    }

    pub fn state_of(&self, key: &str) -> Option<FetchState> {
        self.read().get(key).map(|record| record.state)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self, timeout_ms: u64) -> LazyLoadStats {
        let records = self.read();
        let mut stats = LazyLoadStats {
            total_count: records.len(),
            timeout_ms,
            ..LazyLoadStats::default()
        };

        for (key, record) in records.iter() {
            match record.state {
                FetchState::Loading => {
                    stats.loading_count += 1;
                    stats.loading_files.insert(
                        key.clone(),
                        LoadingFileStat {
                            status: record.state,
                            elapsed_ms: record.started.elapsed().as_millis() as u64,
                        },
                    );
                }
                FetchState::Completed => {
                    stats.completed_count += 1;
                    stats.completed_files.insert(
                        key.clone(),
                        FinishedFileStat {
                            status: record.state,
                            load_time_ms: record.elapsed_ms.unwrap_or_default(),
                            error: None,
                        },
                    );
                }
                FetchState::Failed => {
                    stats.failed_count += 1;
                    stats.failed_files.insert(
                        key.clone(),
                        FinishedFileStat {
                            status: record.state,
                            load_time_ms: record.elapsed_ms.unwrap_or_default(),
                            error: record.error.clone(),
                        },
                    );
                }
            }
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::{Admission, FetchOutcome, Lookup, StatusPool};
    use crate::models::FetchState;

    fn admitted_generation(admission: Admission) -> u64 {
        match admission {
            Admission::Admitted { generation, .. } => generation,
            _ => panic!("expected admission"),
        }
    }

    #[test]
    fn second_admission_joins_the_loading_record() {
        let pool = StatusPool::new();
        admitted_generation(pool.admit("assets/a.png"));
        assert!(matches!(pool.admit("assets/a.png"), Admission::Joined(_)));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn finish_latches_outcome_and_notifies_receivers() {
        let pool = StatusPool::new();
        let (generation, receiver) = match pool.admit("assets/a.png") {
            Admission::Admitted { generation, receiver } => (generation, receiver),
            _ => panic!("expected admission"),
        };

        assert!(pool.finish("assets/a.png", generation, Err("boom".to_string())).is_some());
        assert_eq!(*receiver.borrow(), FetchOutcome::Failed("boom".to_string()));
        assert!(matches!(
            pool.lookup("assets/a.png"),
            Lookup::Finished(FetchOutcome::Failed(message)) if message == "boom"
        ));

        // A second terminal transition is ignored.
        pool.finish("assets/a.png", generation, Ok(()));
        assert_eq!(pool.state_of("assets/a.png"), Some(FetchState::Failed));
    }

    #[test]
    fn stale_generation_cannot_remove_newer_record() {
        let pool = StatusPool::new();
        let first = admitted_generation(pool.admit("k"));
        pool.finish("k", first, Ok(()));
        assert!(pool.remove_if_generation("k", first));

        let second = admitted_generation(pool.admit("k"));
        assert!(!pool.remove_if_generation("k", first));
        assert!(pool.finish("k", first, Ok(())).is_none());
        assert_eq!(pool.state_of("k"), Some(FetchState::Loading));
        assert!(pool.remove_if_generation("k", second));
        assert!(pool.is_empty());
    }

    #[test]
    fn stats_and_clear_terminal_split_by_state() {
        let pool = StatusPool::new();
        let done = admitted_generation(pool.admit("done"));
        let failed = admitted_generation(pool.admit("failed"));
        admitted_generation(pool.admit("loading"));
        pool.finish("done", done, Ok(()));
        pool.finish("failed", failed, Err("missing".to_string()));

        let stats = pool.stats(7_000);
        assert_eq!(stats.total_count, 3);
        assert_eq!(stats.loading_count, 1);
        assert_eq!(stats.completed_count, 1);
        assert_eq!(stats.failed_count, 1);
        assert_eq!(stats.timeout_ms, 7_000);
        assert_eq!(stats.failed_files["failed"].error.as_deref(), Some("missing"));

        assert_eq!(pool.clear_terminal(), 2);
        assert_eq!(pool.state_of("loading"), Some(FetchState::Loading));
    }
}
