use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use serde::Serialize;

use crate::window::{ByteSample, EntityId, RetentionWindow, RETENTION_MS};

/// Aggregation state for one tracked entity (a browser tab).
#[derive(Debug, Clone)]
pub struct EntityTrafficState {
    pub entity_id: EntityId,
    pub url: String,
    pub title: String,
    pub current_speed_bps: u64,
    pub total_bytes: u64,
    pub last_update_ms: i64,
    pub samples: RetentionWindow,
}

impl EntityTrafficState {
    pub fn new(entity_id: EntityId, now_ms: i64) -> Self {
        Self {
            entity_id,
            url: String::new(),
            title: String::new(),
            current_speed_bps: 0,
            total_bytes: 0,
            last_update_ms: now_ms,
            samples: RetentionWindow::new(),
        }
    }

    fn apply_metadata(&mut self, url: Option<&str>, title: Option<&str>) {
        if let Some(url) = url {
            self.url = url.to_string();
        }
        if let Some(title) = title {
            self.title = title.to_string();
        }
    }

    pub fn to_record(&self) -> TabRecord {
        TabRecord {
            tab_id: self.entity_id,
            url: self.url.clone(),
            title: self.title.clone(),
            current_speed: self.current_speed_bps,
            total_bytes: self.total_bytes,
            last_update: self.last_update_ms,
            traffic_data: self.samples.iter().copied().collect(),
        }
    }
}

/// Detached copy of an entity's state in the shape the popup expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TabRecord {
    pub tab_id: EntityId,
    pub url: String,
    pub title: String,
    pub current_speed: u64,
    pub total_bytes: u64,
    pub last_update: i64,
    pub traffic_data: Vec<ByteSample>,
}

/// Entity id → traffic state.
///
/// Mutated only by the ingest thread; pollers read it concurrently through
/// [`EntityRegistry::snapshot_all`].
#[derive(Debug, Default)]
pub struct EntityRegistry {
    entities: DashMap<EntityId, EntityTrafficState>,
    // closed id -> event time it was last heard of. Trailing traffic is
    // dropped while the entry is younger than RETENTION_MS.
    removed: DashMap<EntityId, i64>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self { entities: DashMap::new(), removed: DashMap::new() }
    }

    /// Existing entry, or a zeroed one stamped with `now_ms`. The flag is
    /// `true` when this call created the entry.
    pub fn get_or_create(&self, entity_id: EntityId, now_ms: i64) -> (RefMut<'_, EntityId, EntityTrafficState>, bool) {
        match self.entities.entry(entity_id) {
            Entry::Occupied(e) => (e.into_ref(), false),
            Entry::Vacant(e) => (e.insert(EntityTrafficState::new(entity_id, now_ms)), true),
        }
    }

    /// Explicit creation from the lifecycle collaborator. Converges with a
    /// traffic-created entry: metadata is refreshed, counters are kept.
    pub fn create(&self, entity_id: EntityId, url: Option<&str>, title: Option<&str>, now_ms: i64) -> bool {
        self.removed.remove(&entity_id);
        let (mut state, created) = self.get_or_create(entity_id, now_ms);
        state.apply_metadata(url, title);
        created
    }

    /// Drop the entry and remember the id as closed as of `now_ms`. No-op
    /// on the map if the id was never tracked.
    ///
    /// Tombstones silent for RETENTION_MS are swept here, so the set holds
    /// at most the tabs closed within the last minute of traffic.
    pub fn remove(&self, entity_id: EntityId, now_ms: i64) -> bool {
        let cutoff = now_ms.saturating_sub(RETENTION_MS);
        self.removed.retain(|_, seen| *seen > cutoff);
        self.removed.insert(entity_id, now_ms);
        self.entities.remove(&entity_id).is_some()
    }

    /// `true` if the id was closed and traffic at `now_ms` is trailing
    /// traffic for it. A hit keeps the tombstone alive; an expired one is
    /// dropped and the id may be tracked again.
    pub fn absorb_trailing(&self, entity_id: EntityId, now_ms: i64) -> bool {
        let cutoff = now_ms.saturating_sub(RETENTION_MS);
        let Some(mut seen) = self.removed.get_mut(&entity_id) else {
            return false;
        };
        if *seen <= cutoff {
            drop(seen);
            self.removed.remove(&entity_id);
            return false;
        }
        *seen = (*seen).max(now_ms);
        true
    }

    #[cfg(test)]
    pub(crate) fn tombstones(&self) -> usize {
        self.removed.len()
    }

    /// Metadata for an absent entity is dropped; it never creates one.
    pub fn update_metadata(&self, entity_id: EntityId, url: Option<&str>, title: Option<&str>) -> bool {
        match self.entities.get_mut(&entity_id) {
            Some(mut state) => {
                state.apply_metadata(url, title);
                true
            }
            None => false,
        }
    }

    /// Every entity, heaviest first. Ties go to the lower id.
    pub fn snapshot_all(&self) -> Vec<TabRecord> {
        let mut out: Vec<TabRecord> = self.entities.iter().map(|e| e.value().to_record()).collect();
        out.sort_by(|a, b| b.total_bytes.cmp(&a.total_bytes).then(a.tab_id.cmp(&b.tab_id)));
        out
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
