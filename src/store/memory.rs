use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::wal::Wal;

use super::writer::{wal_writer_loop, WalCommand};
use super::{DoctorDirectory, ReservationStore, StoreError};

pub type SharedLedger = Arc<RwLock<DoctorLedger>>;

#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Reject a CONFIRMED row whose span overlaps another CONFIRMED row of the
    /// same doctor, at write time. When off only the start-time key is unique.
    pub range_exclusion: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            range_exclusion: true,
        }
    }
}

/// WAL-backed store holding every doctor and appointment in memory.
///
/// Each doctor owns one ledger behind a `RwLock`; an upsert holds the write
/// lock from constraint check through WAL append to apply.
pub struct InMemoryStore {
    doctors: DashMap<Ulid, Doctor>,
    /// Lowercased contact email → doctor id.
    emails: DashMap<String, Ulid>,
    ledgers: DashMap<Ulid, SharedLedger>,
    /// Appointment id → doctor id.
    appointment_index: DashMap<Ulid, Ulid>,
    /// Serializes doctor registration and compaction snapshots.
    registration: Mutex<()>,
    wal_tx: mpsc::Sender<WalCommand>,
    options: StoreOptions,
}

fn apply_appointment(ledger: &mut DoctorLedger, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::AppointmentInserted { appointment } => {
            index.insert(appointment.id, appointment.doctor_id);
            ledger.insert(appointment.clone());
        }
        Event::AppointmentUpdated { appointment } => {
            ledger.replace(appointment.clone());
        }
        Event::DoctorRegistered { .. } => {}
    }
}

impl InMemoryStore {
    /// Replay the WAL at `wal_path` and start the group-commit writer.
    /// Must be called inside a tokio runtime.
    pub fn open(wal_path: impl AsRef<Path>, options: StoreOptions) -> io::Result<Self> {
        let wal_path = wal_path.as_ref();
        let events = Wal::replay(wal_path)?;
        let wal = Wal::open(wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let doctors = DashMap::new();
        let emails = DashMap::new();
        let appointment_index = DashMap::new();
        let mut ledgers: HashMap<Ulid, DoctorLedger> = HashMap::new();

        for event in &events {
            match event {
                Event::DoctorRegistered { doctor } => {
                    emails.insert(doctor.contact_email.to_lowercase(), doctor.id);
                    ledgers.insert(doctor.id, DoctorLedger::new(doctor.id));
                    doctors.insert(doctor.id, doctor.clone());
                }
                Event::AppointmentInserted { appointment } | Event::AppointmentUpdated { appointment } => {
                    match ledgers.get_mut(&appointment.doctor_id) {
                        Some(ledger) => apply_appointment(ledger, event, &appointment_index),
                        None => debug!("replay: appointment {} for unknown doctor", appointment.id),
                    }
                }
            }
        }

        info!(
            "replayed {} WAL events: {} doctors, {} appointments",
            events.len(),
            doctors.len(),
            appointment_index.len()
        );

        Ok(Self {
            doctors,
            emails,
            ledgers: ledgers
                .into_iter()
                .map(|(id, ledger)| (id, Arc::new(RwLock::new(ledger))))
                .collect(),
            appointment_index,
            registration: Mutex::new(()),
            wal_tx,
            options,
        })
    }

    pub fn options(&self) -> StoreOptions {
        self.options
    }

    fn ledger(&self, doctor_id: &Ulid) -> Option<SharedLedger> {
        self.ledgers.get(doctor_id).map(|e| e.value().clone())
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    /// WAL-append then apply, under the caller's ledger write lock.
    async fn persist_and_apply(&self, ledger: &mut DoctorLedger, event: Event) -> Result<(), StoreError> {
        self.wal_append(&event).await?;
        apply_appointment(ledger, &event, &self.appointment_index);
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Rewrite the WAL as one registration per doctor plus one insert per current row.
    pub async fn compact_wal(&self) -> Result<(), StoreError> {
        let _registration = self.registration.lock().await;

        let mut doctors: Vec<Doctor> = self.doctors.iter().map(|e| e.value().clone()).collect();
        doctors.sort_by_key(|d| d.id);

        // Ledger read guards stay held until the swap so no acknowledged append is lost.
        let mut guards = Vec::with_capacity(doctors.len());
        for doctor in &doctors {
            if let Some(ledger) = self.ledger(&doctor.id) {
                guards.push(ledger.read_owned().await);
            }
        }

        let mut events: Vec<Event> = doctors
            .into_iter()
            .map(|doctor| Event::DoctorRegistered { doctor })
            .collect();
        for guard in &guards {
            events.extend(guard.appointments.iter().map(|a| Event::AppointmentInserted {
                appointment: a.clone(),
            }));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }
}

#[async_trait]
impl ReservationStore for InMemoryStore {
    async fn find_overlapping(
        &self,
        doctor_id: Ulid,
        status: AppointmentStatus,
        window: Span,
    ) -> Result<Vec<Appointment>, StoreError> {
        let Some(ledger) = self.ledger(&doctor_id) else {
            return Ok(Vec::new());
        };
        let guard = ledger.read().await;
        Ok(guard
            .overlapping(&window)
            .filter(|a| a.status == status)
            .cloned()
            .collect())
    }

    async fn find_exact(&self, doctor_id: Ulid, start: Ms) -> Result<Option<Appointment>, StoreError> {
        let Some(ledger) = self.ledger(&doctor_id) else {
            return Ok(None);
        };
        let guard = ledger.read().await;
        Ok(guard.find_exact(start).cloned())
    }

    async fn find_by_id(&self, id: Ulid) -> Result<Option<Appointment>, StoreError> {
        let Some(doctor_id) = self.appointment_index.get(&id).map(|e| *e.value()) else {
            return Ok(None);
        };
        let Some(ledger) = self.ledger(&doctor_id) else {
            return Ok(None);
        };
        let guard = ledger.read().await;
        Ok(guard.get(id).cloned())
    }

    async fn upsert(
        &self,
        mut appointment: Appointment,
        expected_version: Option<u64>,
    ) -> Result<Appointment, StoreError> {
        let ledger = self
            .ledger(&appointment.doctor_id)
            .ok_or(StoreError::UnknownDoctor(appointment.doctor_id))?;
        let mut guard = ledger.write().await;

        let event = match expected_version {
            None => {
                if guard.find_exact(appointment.span.start).is_some()
                    || self.appointment_index.contains_key(&appointment.id)
                {
                    return Err(StoreError::UniqueViolation(format!(
                        "appointment ({}, {}) already exists",
                        appointment.doctor_id, appointment.span.start
                    )));
                }
                if self.options.range_exclusion
                    && appointment.is_confirmed()
                    && let Some(existing) = guard.confirmed_overlap(&appointment.span, None)
                {
                    return Err(StoreError::RangeOverlap(existing.id));
                }
                if guard.appointments.len() >= MAX_APPOINTMENTS_PER_DOCTOR {
                    return Err(StoreError::LimitExceeded("too many appointments for doctor"));
                }
                appointment.version = 0;
                Event::AppointmentInserted {
                    appointment: appointment.clone(),
                }
            }
            Some(expected) => {
                let current = guard
                    .get(appointment.id)
                    .ok_or(StoreError::NotFound(appointment.id))?;
                if current.version != expected {
                    return Err(StoreError::VersionConflict {
                        id: appointment.id,
                        expected,
                        found: current.version,
                    });
                }
                if current.span.start != appointment.span.start
                    && guard.find_exact(appointment.span.start).is_some()
                {
                    return Err(StoreError::UniqueViolation(format!(
                        "appointment ({}, {}) already exists",
                        appointment.doctor_id, appointment.span.start
                    )));
                }
                if self.options.range_exclusion
                    && appointment.is_confirmed()
                    && let Some(existing) = guard.confirmed_overlap(&appointment.span, Some(appointment.id))
                {
                    return Err(StoreError::RangeOverlap(existing.id));
                }
                appointment.version = expected + 1;
                Event::AppointmentUpdated {
                    appointment: appointment.clone(),
                }
            }
        };

        self.persist_and_apply(&mut guard, event).await?;
        Ok(appointment)
    }
}

#[async_trait]
impl DoctorDirectory for InMemoryStore {
    async fn get_doctor(&self, id: Ulid) -> Result<Option<Doctor>, StoreError> {
        Ok(self.doctors.get(&id).map(|e| e.value().clone()))
    }

    async fn insert_doctor(&self, doctor: Doctor) -> Result<Doctor, StoreError> {
        let _registration = self.registration.lock().await;

        if self.doctors.len() >= MAX_DOCTORS {
            return Err(StoreError::LimitExceeded("too many doctors"));
        }
        let email = doctor.contact_email.to_lowercase();
        if self.emails.contains_key(&email) {
            return Err(StoreError::UniqueViolation(format!(
                "contact email {} already registered",
                doctor.contact_email
            )));
        }
        if self.doctors.contains_key(&doctor.id) {
            return Err(StoreError::UniqueViolation(format!("doctor {} already exists", doctor.id)));
        }

        self.wal_append(&Event::DoctorRegistered {
            doctor: doctor.clone(),
        })
        .await?;
        self.ledgers
            .insert(doctor.id, Arc::new(RwLock::new(DoctorLedger::new(doctor.id))));
        self.emails.insert(email, doctor.id);
        self.doctors.insert(doctor.id, doctor.clone());
        Ok(doctor)
    }

    async fn list_doctors(&self) -> Result<Vec<Doctor>, StoreError> {
        let mut doctors: Vec<Doctor> = self.doctors.iter().map(|e| e.value().clone()).collect();
        doctors.sort_by_key(|d| d.id);
        Ok(doctors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const M: Ms = MINUTE_MS;

    fn wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn doctor(email: &str, slot_minutes: u32) -> Doctor {
        Doctor {
            id: Ulid::new(),
            name: "Dr. Quinn".into(),
            specialization: "Cardiology".into(),
            contact_email: email.into(),
            slot_minutes,
        }
    }

    async fn setup(name: &str, options: StoreOptions) -> (InMemoryStore, Doctor) {
        let store = InMemoryStore::open(wal_path(name), options).unwrap();
        let d = store.insert_doctor(doctor("quinn@example.com", 30)).await.unwrap();
        (store, d)
    }

    #[tokio::test]
    async fn insert_then_find() {
        let (store, d) = setup("insert_find.wal", StoreOptions::default()).await;
        let saved = store
            .upsert(Appointment::confirmed(d.id, "Ann".into(), d.slot_at(60 * M)), None)
            .await
            .unwrap();

        assert_eq!(store.find_by_id(saved.id).await.unwrap(), Some(saved.clone()));
        assert_eq!(store.find_exact(d.id, 60 * M).await.unwrap(), Some(saved.clone()));
        let hits = store
            .find_overlapping(d.id, AppointmentStatus::Confirmed, Span::new(0, 24 * 60 * M))
            .await
            .unwrap();
        assert_eq!(hits, vec![saved]);
        let cancelled = store
            .find_overlapping(d.id, AppointmentStatus::Cancelled, Span::new(0, 24 * 60 * M))
            .await
            .unwrap();
        assert!(cancelled.is_empty());
    }

    #[tokio::test]
    async fn duplicate_start_is_unique_violation() {
        let (store, d) = setup("dup_start.wal", StoreOptions::default()).await;
        store
            .upsert(Appointment::confirmed(d.id, "Ann".into(), d.slot_at(0)), None)
            .await
            .unwrap();
        let err = store
            .upsert(Appointment::confirmed(d.id, "Bob".into(), d.slot_at(0)), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(_)));
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let (store, d) = setup("stale_version.wal", StoreOptions::default()).await;
        let saved = store
            .upsert(Appointment::confirmed(d.id, "Ann".into(), d.slot_at(0)), None)
            .await
            .unwrap();

        let mut first = saved.clone();
        first.status = AppointmentStatus::Cancelled;
        let first = store.upsert(first, Some(0)).await.unwrap();
        assert_eq!(first.version, 1);

        let mut second = saved;
        second.patient_name = "Bob".into();
        let err = store.upsert(second, Some(0)).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                expected: 0,
                found: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn update_of_missing_row_is_not_found() {
        let (store, d) = setup("missing_row.wal", StoreOptions::default()).await;
        let ghost = Appointment::confirmed(d.id, "Ann".into(), d.slot_at(0));
        let err = store.upsert(ghost, Some(0)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn unknown_doctor_is_rejected() {
        let store = InMemoryStore::open(wal_path("unknown_doctor.wal"), StoreOptions::default()).unwrap();
        let err = store
            .upsert(Appointment::confirmed(Ulid::new(), "Ann".into(), Span::new(0, 30 * M)), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownDoctor(_)));
    }

    #[tokio::test]
    async fn range_exclusion_rejects_shifted_overlap() {
        let (store, d) = setup("range_on.wal", StoreOptions::default()).await;
        let first = store
            .upsert(Appointment::confirmed(d.id, "Ann".into(), d.slot_at(0)), None)
            .await
            .unwrap();
        let err = store
            .upsert(Appointment::confirmed(d.id, "Bob".into(), d.slot_at(15 * M)), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RangeOverlap(id) if id == first.id));

        // Adjacent slot is fine.
        store
            .upsert(Appointment::confirmed(d.id, "Cy".into(), d.slot_at(30 * M)), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn range_exclusion_off_admits_shifted_overlap() {
        let (store, d) = setup(
            "range_off.wal",
            StoreOptions {
                range_exclusion: false,
            },
        )
        .await;
        store
            .upsert(Appointment::confirmed(d.id, "Ann".into(), d.slot_at(0)), None)
            .await
            .unwrap();
        store
            .upsert(Appointment::confirmed(d.id, "Bob".into(), d.slot_at(15 * M)), None)
            .await
            .unwrap();
        let hits = store
            .find_overlapping(d.id, AppointmentStatus::Confirmed, Span::new(0, 60 * M))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn cancelled_rows_do_not_exclude() {
        let (store, d) = setup("cancelled_excl.wal", StoreOptions::default()).await;
        let saved = store
            .upsert(Appointment::confirmed(d.id, "Ann".into(), d.slot_at(0)), None)
            .await
            .unwrap();
        let mut cancelled = saved;
        cancelled.status = AppointmentStatus::Cancelled;
        store.upsert(cancelled, Some(0)).await.unwrap();

        store
            .upsert(Appointment::confirmed(d.id, "Bob".into(), d.slot_at(15 * M)), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn email_unique_ignoring_case() {
        let (store, _) = setup("email_unique.wal", StoreOptions::default()).await;
        let err = store
            .insert_doctor(doctor("QUINN@Example.com", 15))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(_)));
        assert_eq!(store.list_doctors().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_doctors_ordered_by_id() {
        let store = InMemoryStore::open(wal_path("list_order.wal"), StoreOptions::default()).unwrap();
        for i in 0..5 {
            store
                .insert_doctor(doctor(&format!("d{i}@example.com"), 20))
                .await
                .unwrap();
        }
        let ids: Vec<Ulid> = store.list_doctors().await.unwrap().iter().map(|d| d.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let path = wal_path("reopen.wal");
        let (d, saved) = {
            let store = InMemoryStore::open(&path, StoreOptions::default()).unwrap();
            let d = store.insert_doctor(doctor("reopen@example.com", 30)).await.unwrap();
            let saved = store
                .upsert(Appointment::confirmed(d.id, "Ann".into(), d.slot_at(0)), None)
                .await
                .unwrap();
            let mut cancelled = saved.clone();
            cancelled.status = AppointmentStatus::Cancelled;
            (d, store.upsert(cancelled, Some(saved.version)).await.unwrap())
        };

        let store = InMemoryStore::open(&path, StoreOptions::default()).unwrap();
        assert_eq!(store.get_doctor(d.id).await.unwrap(), Some(d.clone()));
        assert_eq!(store.find_by_id(saved.id).await.unwrap(), Some(saved.clone()));
        assert_eq!(saved.version, 1);
        assert_eq!(saved.status, AppointmentStatus::Cancelled);
    }

    #[tokio::test]
    async fn compaction_preserves_rows_and_versions() {
        let path = wal_path("compaction.wal");
        let (d, rows) = {
            let store = InMemoryStore::open(&path, StoreOptions::default()).unwrap();
            let d = store.insert_doctor(doctor("compact@example.com", 30)).await.unwrap();
            let mut rows = Vec::new();
            for i in 0..10 {
                let saved = store
                    .upsert(Appointment::confirmed(d.id, format!("p{i}"), d.slot_at(i * 30 * M)), None)
                    .await
                    .unwrap();
                let mut cancelled = saved.clone();
                cancelled.status = AppointmentStatus::Cancelled;
                rows.push(store.upsert(cancelled, Some(0)).await.unwrap());
            }
            assert_eq!(store.wal_appends_since_compact().await, 21);

            let before = std::fs::metadata(&path).unwrap().len();
            store.compact_wal().await.unwrap();
            let after = std::fs::metadata(&path).unwrap().len();
            assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
            assert_eq!(store.wal_appends_since_compact().await, 0);
            (d, rows)
        };

        let store = InMemoryStore::open(&path, StoreOptions::default()).unwrap();
        assert_eq!(store.get_doctor(d.id).await.unwrap(), Some(d));
        for row in rows {
            assert_eq!(store.find_by_id(row.id).await.unwrap(), Some(row));
        }
    }
}
