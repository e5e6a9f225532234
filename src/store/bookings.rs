use std::io;
use std::path::Path;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;
use crate::wal::{Wal, WalHandle};

use super::{BookingStore, StoreError};

/// Booking Store backed by an in-memory index and its own write-ahead log.
pub struct WalBookingStore {
    bookings: DashMap<Ulid, Booking>,
    /// Ids claimed by an insert, including ones still waiting on the log.
    ids: DashSet<Ulid>,
    by_student: DashMap<String, Vec<Ulid>>,
    by_tutor: DashMap<String, Vec<Ulid>>,
    by_window: DashMap<Ulid, Ulid>,
    wal: WalHandle<BookingEvent>,
    gate: RwLock<()>,
}

impl WalBookingStore {
    /// Replay `path` and start the log writer. Must run inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (events, wal): (Vec<BookingEvent>, Wal) = Wal::recover(path)?;
        let store = Self {
            bookings: DashMap::new(),
            ids: DashSet::new(),
            by_student: DashMap::new(),
            by_tutor: DashMap::new(),
            by_window: DashMap::new(),
            wal: WalHandle::spawn(wal),
            gate: RwLock::new(()),
        };
        for event in events {
            match event {
                BookingEvent::Inserted { booking } => {
                    store.ids.insert(booking.id);
                    store.index(booking);
                }
            }
        }
        tracing::info!(
            path = %path.display(),
            bookings = store.bookings.len(),
            "booking store opened"
        );
        Ok(store)
    }

    /// Row first, then the secondary indexes, so a lookup never finds an
    /// id it can't resolve.
    fn index(&self, booking: Booking) {
        let id = booking.id;
        let window_id = booking.window_id;
        let student_id = booking.student_id.clone();
        let tutor_id = booking.tutor_id.clone();
        self.bookings.insert(id, booking);
        self.by_student.entry(student_id).or_default().push(id);
        self.by_tutor.entry(tutor_id).or_default().push(id);
        self.by_window.insert(window_id, id);
    }

    fn collect(&self, ids: Option<Vec<Ulid>>) -> Vec<Booking> {
        let mut out: Vec<Booking> = ids
            .unwrap_or_default()
            .iter()
            .filter_map(|id| self.bookings.get(id).map(|b| b.value().clone()))
            .collect();
        out.sort_by_key(|b| b.span.start);
        out
    }

    pub async fn compact(&self) -> Result<(), StoreError> {
        let _exclusive = self.gate.write().await;
        let events: Vec<BookingEvent> = self
            .bookings
            .iter()
            .map(|e| BookingEvent::Inserted {
                booking: e.value().clone(),
            })
            .collect();
        let count = events.len();
        self.wal.compact(events).await?;
        tracing::info!(bookings = count, "booking log compacted");
        Ok(())
    }

    pub async fn appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }
}

#[async_trait]
impl BookingStore for WalBookingStore {
    async fn insert(&self, booking: Booking) -> Result<(), StoreError> {
        let _shared = self.gate.read().await;
        if !self.ids.insert(booking.id) {
            return Err(StoreError::DuplicateId(booking.id));
        }
        if let Err(e) = self
            .wal
            .append(BookingEvent::Inserted {
                booking: booking.clone(),
            })
            .await
        {
            self.ids.remove(&booking.id);
            return Err(e);
        }
        self.index(booking);
        Ok(())
    }

    async fn list_by_student(&self, student_id: &str) -> Result<Vec<Booking>, StoreError> {
        let ids = self.by_student.get(student_id).map(|e| e.value().clone());
        Ok(self.collect(ids))
    }

    async fn list_by_tutor(&self, tutor_id: &str) -> Result<Vec<Booking>, StoreError> {
        let ids = self.by_tutor.get(tutor_id).map(|e| e.value().clone());
        Ok(self.collect(ids))
    }

    async fn get_by_window(&self, window_id: Ulid) -> Result<Option<Booking>, StoreError> {
        let Some(id) = self.by_window.get(&window_id).map(|e| *e.value()) else {
            return Ok(None);
        };
        Ok(self.bookings.get(&id).map(|b| b.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("tutorslot_test_bookings");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn booking(student: &str, tutor: &str, start: Ms) -> Booking {
        Booking {
            id: Ulid::new(),
            window_id: Ulid::new(),
            student_id: student.into(),
            tutor_id: tutor.into(),
            span: Span::new(start, start + 1_800_000),
            booked_at: 1,
        }
    }

    #[tokio::test]
    async fn insert_and_list_by_participant() {
        let store = WalBookingStore::open(&test_wal_path("list.wal")).unwrap();
        let late = booking("alice", "tutor-1", 5_000_000);
        let early = booking("alice", "tutor-2", 1_000_000);
        let other = booking("bob", "tutor-1", 3_000_000);
        for b in [&late, &early, &other] {
            store.insert(b.clone()).await.unwrap();
        }

        let alice = store.list_by_student("alice").await.unwrap();
        assert_eq!(alice, vec![early.clone(), late.clone()]);

        let tutor1 = store.list_by_tutor("tutor-1").await.unwrap();
        assert_eq!(tutor1, vec![other.clone(), late.clone()]);

        assert!(store.list_by_student("carol").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_id_rejected() {
        let store = WalBookingStore::open(&test_wal_path("dup.wal")).unwrap();
        let b = booking("alice", "tutor-1", 0);
        store.insert(b.clone()).await.unwrap();

        let mut again = booking("bob", "tutor-2", 0);
        again.id = b.id;
        assert!(matches!(
            store.insert(again).await,
            Err(StoreError::DuplicateId(id)) if id == b.id
        ));
        assert!(store.list_by_student("bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_by_window() {
        let store = WalBookingStore::open(&test_wal_path("by_window.wal")).unwrap();
        let b = booking("alice", "tutor-1", 0);
        store.insert(b.clone()).await.unwrap();

        assert_eq!(store.get_by_window(b.window_id).await.unwrap(), Some(b));
        assert_eq!(store.get_by_window(Ulid::new()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn bookings_survive_reopen_and_compaction() {
        let path = test_wal_path("reopen.wal");
        let b = booking("alice", "tutor-1", 0);
        {
            let store = WalBookingStore::open(&path).unwrap();
            store.insert(b.clone()).await.unwrap();
            store.compact().await.unwrap();
            assert_eq!(store.appends_since_compact().await, 0);
        }

        let store = WalBookingStore::open(&path).unwrap();
        assert_eq!(store.list_by_tutor("tutor-1").await.unwrap(), vec![b.clone()]);
        assert!(matches!(
            store.insert(b.clone()).await,
            Err(StoreError::DuplicateId(_))
        ));
    }
}
