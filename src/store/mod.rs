mod memory;
mod writer;

pub use memory::{InMemoryStore, StoreOptions};

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Another row already holds this `(doctor_id, start)` key or id, or the
    /// doctor's contact email is taken.
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    /// The row changed since the writer read it.
    #[error("version conflict on {id}: expected {expected}, found {found}")]
    VersionConflict { id: Ulid, expected: u64, found: u64 },
    /// A CONFIRMED row would overlap another CONFIRMED row of the same doctor.
    #[error("range exclusion violated by {0}")]
    RangeOverlap(Ulid),
    #[error("unknown doctor: {0}")]
    UnknownDoctor(Ulid),
    #[error("no such row: {0}")]
    NotFound(Ulid),
    #[error("store limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("{0}: commit without a staged write")]
    NothingStaged(&'static str),
    #[error("WAL error: {0}")]
    Wal(String),
}

/// Appointment persistence the booking core relies on.
///
/// Implementations must apply each `upsert` atomically and enforce:
/// uniqueness of `(doctor_id, span.start)`, and the version guard on updates.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Rows of `doctor_id` with `status` whose span satisfies
    /// `row.start < window.end && row.end > window.start`, ordered by start.
    async fn find_overlapping(
        &self,
        doctor_id: Ulid,
        status: AppointmentStatus,
        window: Span,
    ) -> Result<Vec<Appointment>, StoreError>;

    async fn find_exact(&self, doctor_id: Ulid, start: Ms) -> Result<Option<Appointment>, StoreError>;

    async fn find_by_id(&self, id: Ulid) -> Result<Option<Appointment>, StoreError>;

    /// `expected_version = None` inserts a fresh row (version 0).
    /// `Some(v)` updates the row with `appointment.id`, only if its version is still `v`;
    /// the stored version becomes `v + 1`. Returns the row as stored.
    async fn upsert(
        &self,
        appointment: Appointment,
        expected_version: Option<u64>,
    ) -> Result<Appointment, StoreError>;
}

/// Doctor records consumed by the core.
#[async_trait]
pub trait DoctorDirectory: Send + Sync {
    async fn get_doctor(&self, id: Ulid) -> Result<Option<Doctor>, StoreError>;

    /// Fails with `UniqueViolation` when the contact email (case-insensitive) is taken.
    async fn insert_doctor(&self, doctor: Doctor) -> Result<Doctor, StoreError>;

    /// All doctors ordered by id.
    async fn list_doctors(&self) -> Result<Vec<Doctor>, StoreError>;
}

/// A single read-decide-write sequence against a [`ReservationStore`].
///
/// Reads go straight to the store (read committed). At most one write is
/// staged and applied by [`UnitOfWork::commit`]. Dropping an uncommitted unit
/// aborts it: nothing staged reaches the store.
pub struct UnitOfWork {
    store: Arc<dyn ReservationStore>,
    label: &'static str,
    staged: Option<(Appointment, Option<u64>)>,
    finished: bool,
}

impl UnitOfWork {
    pub fn begin(store: Arc<dyn ReservationStore>, label: &'static str) -> Self {
        Self {
            store,
            label,
            staged: None,
            finished: false,
        }
    }

    pub async fn find_overlapping(
        &self,
        doctor_id: Ulid,
        status: AppointmentStatus,
        window: Span,
    ) -> Result<Vec<Appointment>, StoreError> {
        self.store.find_overlapping(doctor_id, status, window).await
    }

    pub async fn find_exact(&self, doctor_id: Ulid, start: Ms) -> Result<Option<Appointment>, StoreError> {
        self.store.find_exact(doctor_id, start).await
    }

    pub async fn find_by_id(&self, id: Ulid) -> Result<Option<Appointment>, StoreError> {
        self.store.find_by_id(id).await
    }

    /// Stage the unit's write. A later call replaces an earlier one.
    pub fn stage(&mut self, appointment: Appointment, expected_version: Option<u64>) {
        self.staged = Some((appointment, expected_version));
    }

    /// Apply the staged write. Committing with nothing staged is a store error.
    pub async fn commit(mut self) -> Result<Appointment, StoreError> {
        self.finished = true;
        let (appointment, expected_version) = self
            .staged
            .take()
            .ok_or(StoreError::NothingStaged(self.label))?;
        let result = self.store.upsert(appointment, expected_version).await;
        if let Err(e) = &result {
            debug!(unit = self.label, "unit of work rejected at commit: {e}");
            metrics::counter!(crate::observability::UNITS_ABORTED_TOTAL, "unit" => self.label)
                .increment(1);
        }
        result
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if !self.finished {
            debug!(unit = self.label, staged = self.staged.is_some(), "unit of work aborted");
            metrics::counter!(crate::observability::UNITS_ABORTED_TOTAL, "unit" => self.label)
                .increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store(name: &str) -> Arc<InMemoryStore> {
        let dir = std::env::temp_dir().join("slotbook_test_uow");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        Arc::new(InMemoryStore::open(path, StoreOptions::default()).unwrap())
    }

    async fn doctor(store: &InMemoryStore) -> Doctor {
        store
            .insert_doctor(Doctor {
                id: Ulid::new(),
                name: "Dr. House".into(),
                specialization: "Diagnostics".into(),
                contact_email: format!("{}@example.com", Ulid::new()),
                slot_minutes: 30,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn dropped_unit_writes_nothing() {
        let store = test_store("dropped.wal");
        let d = doctor(&store).await;
        {
            let mut uow = UnitOfWork::begin(store.clone(), "test");
            uow.stage(Appointment::confirmed(d.id, "Alice".into(), d.slot_at(0)), None);
        }
        assert!(store.find_exact(d.id, 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn commit_applies_staged_write() {
        let store = test_store("commit.wal");
        let d = doctor(&store).await;
        let mut uow = UnitOfWork::begin(store.clone(), "test");
        uow.stage(Appointment::confirmed(d.id, "Alice".into(), d.slot_at(0)), None);
        let saved = uow.commit().await.unwrap();
        assert_eq!(saved.version, 0);
        assert_eq!(store.find_exact(d.id, 0).await.unwrap(), Some(saved));
    }

    #[tokio::test]
    async fn commit_without_stage_fails() {
        let store = test_store("empty_commit.wal");
        let uow = UnitOfWork::begin(store, "test");
        assert!(uow.commit().await.is_err());
    }
}
