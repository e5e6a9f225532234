use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::limits::MAX_WINDOWS_PER_OWNER;
use crate::model::*;
use crate::wal::{Wal, WalHandle};

use super::{MarkHeld, Release, Removal, StoreError, WindowStore};

pub type SharedOwnerWindows = Arc<RwLock<OwnerWindows>>;

/// Interval Store backed by an in-memory index and a write-ahead log.
///
/// Windows are grouped per owner behind one `RwLock` each; every conditional
/// update takes the owner's write lock, checks the flag, logs the event and
/// applies it before releasing the lock. That is the row lock a relational
/// backend would take for `UPDATE ... WHERE id = ? AND held = 0`.
pub struct WalWindowStore {
    owners: DashMap<String, SharedOwnerWindows>,
    /// Reverse lookup: window id → owner id.
    window_to_owner: DashMap<Ulid, String>,
    wal: WalHandle<WindowEvent>,
    /// Mutations hold this shared; compaction holds it exclusively so no
    /// append can slip between the snapshot and the file swap.
    gate: RwLock<()>,
}

/// Apply an event to an owner's windows. Caller holds the owner lock.
fn apply_to_owner(ow: &mut OwnerWindows, event: &WindowEvent) {
    match event {
        WindowEvent::Put { window } => {
            ow.remove_window(window.id);
            ow.insert_window(window.clone());
        }
        WindowEvent::Held { id, at, .. } => {
            if let Some(w) = ow.window_mut(*id) {
                w.held = true;
                w.held_at = Some(*at);
            }
        }
        WindowEvent::Released { id, .. } => {
            if let Some(w) = ow.window_mut(*id) {
                w.held = false;
                w.held_at = None;
            }
        }
        WindowEvent::Removed { id, .. } => {
            ow.remove_window(*id);
        }
    }
}

impl WalWindowStore {
    /// Replay `path` and start the log writer. Must run inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (events, wal): (Vec<WindowEvent>, Wal) = Wal::recover(path)?;

        let mut owners: HashMap<String, OwnerWindows> = HashMap::new();
        let window_to_owner = DashMap::new();
        for event in &events {
            let owner_id = event.owner_id();
            let ow = owners
                .entry(owner_id.to_string())
                .or_insert_with(|| OwnerWindows::new(owner_id));
            apply_to_owner(ow, event);
            match event {
                WindowEvent::Put { window } => {
                    window_to_owner.insert(window.id, window.owner_id.clone());
                }
                WindowEvent::Removed { id, .. } => {
                    window_to_owner.remove(id);
                }
                WindowEvent::Held { .. } | WindowEvent::Released { .. } => {}
            }
        }

        let restored = window_to_owner.len();
        let store = Self {
            owners: owners
                .into_iter()
                .map(|(id, ow)| (id, Arc::new(RwLock::new(ow))))
                .collect(),
            window_to_owner,
            wal: WalHandle::spawn(wal),
            gate: RwLock::new(()),
        };
        tracing::info!(
            path = %path.display(),
            events = events.len(),
            windows = restored,
            "window store opened"
        );
        Ok(store)
    }

    fn owner(&self, owner_id: &str) -> Option<SharedOwnerWindows> {
        self.owners.get(owner_id).map(|e| e.value().clone())
    }

    fn owner_or_create(&self, owner_id: &str) -> SharedOwnerWindows {
        self.owners
            .entry(owner_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(OwnerWindows::new(owner_id))))
            .value()
            .clone()
    }

    /// Lookup window → owner, acquire the owner's write lock.
    async fn resolve_window_write(
        &self,
        id: Ulid,
    ) -> Option<OwnedRwLockWriteGuard<OwnerWindows>> {
        let owner_id = self.window_to_owner.get(&id).map(|e| e.value().clone())?;
        let ow = self.owner(&owner_id)?;
        Some(ow.write_owned().await)
    }

    /// WAL-append then apply, with the owner lock already held.
    async fn persist_and_apply(
        &self,
        ow: &mut OwnerWindows,
        event: WindowEvent,
    ) -> Result<(), StoreError> {
        self.wal.append(event.clone()).await?;
        apply_to_owner(ow, &event);
        Ok(())
    }

    /// Rewrite the log with one `Put` per live window.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _exclusive = self.gate.write().await;
        let owners: Vec<SharedOwnerWindows> =
            self.owners.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();
        for ow in owners {
            let guard = ow.read().await;
            events.extend(
                guard
                    .windows
                    .iter()
                    .map(|w| WindowEvent::Put { window: w.clone() }),
            );
        }
        let count = events.len();
        self.wal.compact(events).await?;
        tracing::info!(windows = count, "window log compacted");
        Ok(())
    }

    pub async fn appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }
}

#[async_trait]
impl WindowStore for WalWindowStore {
    async fn put(&self, window: AvailabilityWindow) -> Result<(), StoreError> {
        let _shared = self.gate.read().await;

        // Claim the id for this owner before touching any lock, so two puts
        // of a fresh id can't land under different owners.
        let fresh = match self.window_to_owner.entry(window.id) {
            Entry::Occupied(e) if e.get() != &window.owner_id => {
                return Err(StoreError::OwnerChanged(window.id));
            }
            Entry::Occupied(_) => false,
            Entry::Vacant(e) => {
                e.insert(window.owner_id.clone());
                true
            }
        };

        let ow = self.owner_or_create(&window.owner_id);
        let mut guard = ow.write().await;

        let id = window.id;
        let owner_id = window.owner_id.clone();
        let result = match guard.window(id) {
            Some(existing) if existing.held => Err(StoreError::WindowHeld(id)),
            None if guard.windows.len() >= MAX_WINDOWS_PER_OWNER => {
                Err(StoreError::LimitExceeded("too many windows for owner"))
            }
            _ => self.persist_and_apply(&mut guard, WindowEvent::Put { window }).await,
        };

        // Both branches run under the owner lock. A `remove` of this id that
        // got the lock first has already dropped the mapping, so restore it.
        match &result {
            Ok(()) => {
                self.window_to_owner.insert(id, owner_id);
            }
            Err(_) if fresh => {
                self.window_to_owner.remove(&id);
            }
            Err(_) => {}
        }
        drop(guard);
        result
    }

    async fn get(&self, id: Ulid) -> Result<Option<AvailabilityWindow>, StoreError> {
        let Some(owner_id) = self.window_to_owner.get(&id).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        let Some(ow) = self.owner(&owner_id) else {
            return Ok(None);
        };
        let guard = ow.read().await;
        Ok(guard.window(id).cloned())
    }

    async fn list_open(&self, owner_id: &str) -> Result<Vec<AvailabilityWindow>, StoreError> {
        let Some(ow) = self.owner(owner_id) else {
            return Ok(Vec::new());
        };
        let guard = ow.read().await;
        Ok(guard.open_windows().cloned().collect())
    }

    async fn list_in_range(
        &self,
        owner_id: &str,
        from: Ms,
        to: Ms,
    ) -> Result<Vec<AvailabilityWindow>, StoreError> {
        let Some(ow) = self.owner(owner_id) else {
            return Ok(Vec::new());
        };
        let guard = ow.read().await;
        Ok(guard.within(from, to).cloned().collect())
    }

    async fn mark_held(&self, id: Ulid, at: Ms) -> Result<MarkHeld, StoreError> {
        let _shared = self.gate.read().await;
        let Some(mut guard) = self.resolve_window_write(id).await else {
            return Ok(MarkHeld::NotFound);
        };
        let owner_id = match guard.window(id) {
            None => return Ok(MarkHeld::NotFound),
            Some(w) if w.held => return Ok(MarkHeld::AlreadyHeld),
            Some(w) => w.owner_id.clone(),
        };

        self.persist_and_apply(&mut guard, WindowEvent::Held { id, owner_id, at })
            .await?;
        match guard.window(id) {
            Some(w) => Ok(MarkHeld::Held(w.clone())),
            None => Ok(MarkHeld::NotFound),
        }
    }

    async fn release(&self, id: Ulid) -> Result<Release, StoreError> {
        let _shared = self.gate.read().await;
        let Some(mut guard) = self.resolve_window_write(id).await else {
            return Ok(Release::NotFound);
        };
        let owner_id = match guard.window(id) {
            None => return Ok(Release::NotFound),
            Some(w) if !w.held => return Ok(Release::NotHeld),
            Some(w) => w.owner_id.clone(),
        };

        self.persist_and_apply(&mut guard, WindowEvent::Released { id, owner_id })
            .await?;
        Ok(Release::Released)
    }

    async fn remove(&self, id: Ulid) -> Result<Removal, StoreError> {
        let _shared = self.gate.read().await;
        let Some(mut guard) = self.resolve_window_write(id).await else {
            return Ok(Removal::NotFound);
        };
        let window = match guard.window(id) {
            None => return Ok(Removal::NotFound),
            Some(w) if w.held => return Ok(Removal::Held),
            Some(w) => w.clone(),
        };

        let event = WindowEvent::Removed {
            id,
            owner_id: window.owner_id.clone(),
        };
        self.persist_and_apply(&mut guard, event).await?;
        self.window_to_owner.remove(&id);
        Ok(Removal::Removed(window))
    }

    async fn list_held_before(&self, cutoff: Ms) -> Result<Vec<AvailabilityWindow>, StoreError> {
        let owners: Vec<SharedOwnerWindows> =
            self.owners.iter().map(|e| e.value().clone()).collect();
        let mut held = Vec::new();
        for ow in owners {
            let guard = ow.read().await;
            held.extend(
                guard
                    .windows
                    .iter()
                    .filter(|w| w.held && w.held_at.is_some_and(|at| at <= cutoff))
                    .cloned(),
            );
        }
        Ok(held)
    }
}
