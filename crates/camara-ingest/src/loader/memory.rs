//! In-memory store with the same keys and constraints as the SQL schema

use async_trait::async_trait;
use camara_common::Entity;
use chrono::NaiveDateTime;
use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};
use tracing::warn;

use super::{LoadReport, Loader, SkippedRow};
use crate::{
    error::{IngestError, Result},
    models::{Batch, Deputy, Expense, Record, Speech, Vote, VotingSession},
};

/// Contents of every table, keyed by natural key
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tables {
    pub deputies: BTreeMap<i64, Deputy>,
    pub expenses: BTreeMap<(i64, i32, i32, i64), Expense>,
    pub speeches: BTreeMap<(i64, NaiveDateTime), Speech>,
    pub voting_sessions: BTreeMap<String, VotingSession>,
    pub votes: BTreeMap<(String, i64), Vote>,
}

impl Tables {
    pub fn row_count(&self, entity: Entity) -> usize {
        match entity {
            Entity::Deputies => self.deputies.len(),
            Entity::Expenses => self.expenses.len(),
            Entity::Speeches => self.speeches.len(),
            Entity::VotingSessions => self.voting_sessions.len(),
            Entity::Votes => self.votes.len(),
        }
    }

    /// Apply one record, or explain which constraint it violates
    fn upsert(&mut self, record: &Record) -> std::result::Result<(), String> {
        match record {
            Record::Deputy(d) => {
                self.deputies.insert(d.id, d.clone());
            },
            Record::Expense(e) => {
                self.require_deputy(e.deputy_id)?;
                if !(1..=12).contains(&e.month) {
                    return Err(format!("check violation: month {} out of range", e.month));
                }
                self.expenses.insert(
                    (e.deputy_id, e.year, e.month, e.document_code),
                    e.clone(),
                );
            },
            Record::Speech(s) => {
                self.require_deputy(s.deputy_id)?;
                self.speeches.insert((s.deputy_id, s.started_at), s.clone());
            },
            Record::VotingSession(v) => {
                self.voting_sessions.insert(v.id.clone(), v.clone());
            },
            Record::Vote(v) => {
                if !self.voting_sessions.contains_key(&v.session_id) {
                    return Err(format!(
                        "foreign key violation: voting session {} not found",
                        v.session_id
                    ));
                }
                self.require_deputy(v.deputy_id)?;
                self.votes
                    .insert((v.session_id.clone(), v.deputy_id), v.clone());
            },
        }
        Ok(())
    }

    fn require_deputy(&self, id: i64) -> std::result::Result<(), String> {
        if self.deputies.contains_key(&id) {
            Ok(())
        } else {
            Err(format!("foreign key violation: deputy {id} not found"))
        }
    }
}

/// [`Loader`] backed by process memory.
///
/// Batches are applied to a copy of the tables and swapped in on success, so
/// a failed batch leaves no trace.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    upserts: AtomicUsize,
    batches: AtomicUsize,
    failing: Mutex<HashSet<Entity>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later batch for `entity` fail as if the table were missing
    pub fn fail_batches_for(&self, entity: Entity) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(entity);
        }
    }

    pub fn snapshot(&self) -> Tables {
        self.tables.lock().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn row_count(&self, entity: Entity) -> usize {
        self.tables
            .lock()
            .map(|t| t.row_count(entity))
            .unwrap_or_default()
    }

    /// Rows written across all committed batches, repeats included
    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub fn committed_batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    /// Seed rows outside any batch, without touching the batch counters.
    ///
    /// Parents are inserted as given; any other row must satisfy the same
    /// keys and references as a batch row, or seeding stops with an error.
    pub fn seed(&self, records: impl IntoIterator<Item = Record>) -> Result<()> {
        let mut tables = self.tables.lock().map_err(|_| poisoned())?;
        for record in records {
            match record {
                Record::Deputy(d) => {
                    tables.deputies.insert(d.id, d);
                },
                Record::VotingSession(v) => {
                    tables.voting_sessions.insert(v.id.clone(), v);
                },
                other => tables.upsert(&other).map_err(|reason| {
                    IngestError::Structural(format!("cannot seed {}: {reason}", other.key()))
                })?,
            }
        }
        Ok(())
    }
}

fn poisoned() -> IngestError {
    IngestError::Structural("in-memory store lock poisoned".to_string())
}

#[async_trait]
impl Loader for InMemoryStore {
    async fn upsert_batch(&self, batch: &Batch) -> Result<LoadReport> {
        if self.failing.lock().map_err(|_| poisoned())?.contains(&batch.entity) {
            return Err(IngestError::Structural(format!(
                "relation for {} is unavailable",
                batch.entity
            )));
        }

        let mut tables = self.tables.lock().map_err(|_| poisoned())?;
        let mut working = tables.clone();
        let mut report = LoadReport::default();

        for record in batch.ordered() {
            match working.upsert(record) {
                Ok(()) => report.upserted += 1,
                Err(reason) => {
                    warn!(entity = %batch.entity, key = %record.key(), %reason, "Skipping row");
                    report.skipped.push(SkippedRow {
                        key: record.key(),
                        reason,
                    });
                },
            }
        }

        *tables = working;
        self.upserts.fetch_add(report.upserted, Ordering::SeqCst);
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(report)
    }

    async fn deputy_ids(&self) -> Result<Vec<i64>> {
        let tables = self.tables.lock().map_err(|_| poisoned())?;
        Ok(tables.deputies.keys().copied().collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::models::RecordKey;

    fn deputy(id: i64) -> Record {
        Record::Deputy(Deputy {
            id,
            ..Deputy::default()
        })
    }

    fn vote(session: &str, deputy_id: i64) -> Record {
        Record::Vote(Vote {
            session_id: session.to_string(),
            deputy_id,
            ..Vote::default()
        })
    }

    fn session(id: &str) -> Record {
        Record::VotingSession(VotingSession {
            id: id.to_string(),
            ..VotingSession::default()
        })
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = InMemoryStore::new();
        let batch = Batch::new(Entity::Deputies, vec![deputy(1), deputy(2)]);

        store.upsert_batch(&batch).await.unwrap();
        store.upsert_batch(&batch).await.unwrap();

        assert_eq!(store.row_count(Entity::Deputies), 2);
        assert_eq!(store.upsert_count(), 4);
        assert_eq!(store.deputy_ids().await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_parent_in_same_batch_is_written_first() {
        let store = InMemoryStore::new();
        store.seed([deputy(7)]).unwrap();

        let batch = Batch::new(Entity::Votes, vec![vote("9-1", 7), session("9-1")]);
        let report = store.upsert_batch(&batch).await.unwrap();

        assert_eq!(report.upserted, 2);
        assert!(report.skipped.is_empty());
    }

    #[tokio::test]
    async fn test_fk_violation_skips_only_that_row() {
        let store = InMemoryStore::new();
        store.seed([deputy(1), deputy(2)]).unwrap();

        let batch = Batch::new(
            Entity::Votes,
            vec![session("5-5"), vote("5-5", 1), vote("5-5", 99), vote("5-5", 2)],
        );
        let report = store.upsert_batch(&batch).await.unwrap();

        assert_eq!(report.upserted, 3);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(
            report.skipped[0].key,
            RecordKey::Vote {
                session_id: "5-5".into(),
                deputy_id: 99
            }
        );
        assert_eq!(store.row_count(Entity::Votes), 2);
    }

    #[tokio::test]
    async fn test_structural_failure_keeps_nothing() {
        let store = InMemoryStore::new();
        store.fail_batches_for(Entity::Deputies);

        let err = store
            .upsert_batch(&Batch::new(Entity::Deputies, vec![deputy(1)]))
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::Structural(_)));
        assert_eq!(store.row_count(Entity::Deputies), 0);
        assert_eq!(store.committed_batches(), 0);
    }

    #[tokio::test]
    async fn test_expense_month_check() {
        let store = InMemoryStore::new();
        store.seed([deputy(1)]).unwrap();
        let bad = Record::Expense(Expense {
            deputy_id: 1,
            year: 2024,
            month: 13,
            document_code: 1,
            ..Expense::default()
        });

        let report = store
            .upsert_batch(&Batch::new(Entity::Expenses, vec![bad]))
            .await
            .unwrap();
        assert_eq!(report.upserted, 0);
        assert!(report.skipped[0].reason.starts_with("check violation"));
    }

    #[test]
    fn test_seed_rejects_orphan_rows() {
        let store = InMemoryStore::new();
        store.seed([deputy(1)]).unwrap();

        let err = store.seed([vote("3-1", 1)]).unwrap_err();
        assert!(matches!(err, IngestError::Structural(_)));

        store.seed([session("3-1"), vote("3-1", 1)]).unwrap();
        assert_eq!(store.row_count(Entity::Votes), 1);
        assert_eq!(store.committed_batches(), 0);
    }
}
