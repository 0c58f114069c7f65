use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::store::{InMemoryStore, StoreError};

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(store: Arc<InMemoryStore>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&store, threshold).await {
            warn!("WAL compaction failed: {e}");
        }
    }
}

/// Compact when at least `threshold` appends happened since the last compaction.
/// Returns whether a compaction ran.
pub async fn compact_if_needed(store: &InMemoryStore, threshold: u64) -> Result<bool, StoreError> {
    let appends = store.wal_appends_since_compact().await;
    if appends < threshold {
        debug!("compactor: {appends} appends since last compaction, below {threshold}");
        return Ok(false);
    }
    store.compact_wal().await?;
    info!("compacted WAL after {appends} appends");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::store::{DoctorDirectory, ReservationStore, StoreOptions};
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let store = InMemoryStore::open(&path, StoreOptions::default()).unwrap();
        let d = store
            .insert_doctor(Doctor {
                id: Ulid::new(),
                name: "Dr. Kildare".into(),
                specialization: "General".into(),
                contact_email: "kildare@example.com".into(),
                slot_minutes: 15,
            })
            .await
            .unwrap();
        let row = store
            .upsert(Appointment::confirmed(d.id, "Ann".into(), d.slot_at(0)), None)
            .await
            .unwrap();

        assert!(!compact_if_needed(&store, 5).await.unwrap());

        let mut current = row;
        for i in 0..4 {
            current.status = if i % 2 == 0 {
                AppointmentStatus::Cancelled
            } else {
                AppointmentStatus::Confirmed
            };
            current = store.upsert(current.clone(), Some(current.version)).await.unwrap();
        }
        assert_eq!(store.wal_appends_since_compact().await, 6);

        assert!(compact_if_needed(&store, 5).await.unwrap());
        assert_eq!(store.wal_appends_since_compact().await, 0);

        drop(store);
        let reopened = InMemoryStore::open(&path, StoreOptions::default()).unwrap();
        assert_eq!(reopened.find_by_id(current.id).await.unwrap(), Some(current));
    }
}
