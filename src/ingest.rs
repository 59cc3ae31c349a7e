use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::badge::{Badge, BadgeSink};
use crate::daily::{utc_date, DailyCounter};
use crate::event::{Completion, HostEvent};
use crate::metrics::RateAggregator;
use crate::state::EntityRegistry;
use crate::store::StoreError;
use crate::window::{ByteSample, EntityId};

/// Url and title as reported by the host's tab lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityInfo {
    pub url: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("no entity with id {0}")]
    NotFound(EntityId),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to persist daily counter: {0}")]
    Persist(#[from] StoreError),
}

/// Host-side tab lookup, used to backfill metadata for entities first seen
/// through traffic.
pub trait EntityLookup: Send + Sync {
    fn lookup(&self, entity_id: EntityId) -> Result<EntityInfo, LookupError>;
}

/// Which entity is in the foreground, if any.
pub trait FocusSource: Send {
    fn active_entity(&self) -> Option<EntityId>;
}

/// Starts a metadata lookup whose result comes back later through
/// [`EventIngestor::apply_backfill`].
pub trait BackfillRequester: Send {
    fn request(&mut self, entity_id: EntityId);
}

/// What happened to one completion event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingested {
    /// No tab behind the request, or the tab was already closed.
    Discarded,
    Recorded { entity_id: EntityId, bytes: u64, current_speed_bps: u64, total_bytes: u64, created: bool },
}

/// Single consumer of host events. Owns the daily counter outright and is
/// the only writer to the registry.
pub struct EventIngestor {
    registry: Arc<EntityRegistry>,
    daily: DailyCounter,
    rate: RateAggregator,
    focus: Box<dyn FocusSource>,
    badge: Option<Box<dyn BadgeSink>>,
    backfill: Box<dyn BackfillRequester>,
    // newest completion timestamp seen; removals are stamped with it
    clock_ms: Option<i64>,
}

impl EventIngestor {
    pub fn new(
        registry: Arc<EntityRegistry>,
        daily: DailyCounter,
        focus: Box<dyn FocusSource>,
        backfill: Box<dyn BackfillRequester>,
    ) -> Self {
        Self { registry, daily, rate: RateAggregator::default(), focus, badge: None, backfill, clock_ms: None }
    }

    pub fn with_badge(mut self, sink: Box<dyn BadgeSink>) -> Self {
        self.badge = Some(sink);
        self
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    pub fn daily(&self) -> &DailyCounter {
        &self.daily
    }

    /// Dispatch one host event. Failures are logged here and never
    /// propagate; the next event starts from clean state.
    pub fn handle(&mut self, event: HostEvent, now_ms: i64) {
        match event {
            HostEvent::Completed(completion) => {
                let entity_id = completion.entity_id;
                match self.ingest(&completion) {
                    Ok(Ingested::Recorded { entity_id, bytes, current_speed_bps, total_bytes, created }) => {
                        trace!(tab = entity_id, bytes, speed_bps = current_speed_bps, total_bytes, created, "Recorded sample");
                    }
                    Ok(Ingested::Discarded) => trace!(tab = entity_id, "Completion discarded"),
                    Err(e) => warn!(tab = entity_id, error = %e, "Dropped completion event"),
                }
            }
            HostEvent::Created { entity_id, url, title } => {
                let created = self.registry.create(entity_id, url.as_deref(), title.as_deref(), now_ms);
                debug!(tab = entity_id, created, "Tab created");
            }
            HostEvent::Updated { entity_id, url, title } => {
                if !self.registry.update_metadata(entity_id, url.as_deref(), title.as_deref()) {
                    trace!(tab = entity_id, "Metadata for untracked tab ignored");
                }
            }
            HostEvent::Removed { entity_id } => {
                if self.registry.remove(entity_id, self.clock_ms.unwrap_or(now_ms)) {
                    debug!(tab = entity_id, "Tab removed");
                }
            }
            HostEvent::Activated { entity_id } => {
                trace!(tab = entity_id, "Focus changed");
            }
        }
    }

    /// Run one completion through the window, rate, daily counter and badge.
    pub fn ingest(&mut self, completion: &Completion) -> Result<Ingested, IngestError> {
        let entity_id = completion.entity_id;
        if !completion.has_entity() {
            return Ok(Ingested::Discarded);
        }
        let arrived_ms = completion.timestamp_ms;
        self.clock_ms = Some(self.clock_ms.map_or(arrived_ms, |c| c.max(arrived_ms)));
        // the host keeps delivering completions for a tab after closing it
        if self.registry.absorb_trailing(entity_id, arrived_ms) {
            return Ok(Ingested::Discarded);
        }
        let bytes = completion.content_length();

        // shard guard must be released before the daily write
        let (current_speed_bps, total_bytes, created) = {
            let (mut state, created) = self.registry.get_or_create(entity_id, arrived_ms);
            let now_ms = state.samples.append(ByteSample::received(entity_id, arrived_ms, bytes));
            if now_ms != arrived_ms {
                debug!(tab = entity_id, arrived_ms, filed_ms = now_ms, "Out-of-order completion filed at latest sample time");
            }
            state.total_bytes = state.total_bytes.saturating_add(bytes);
            state.last_update_ms = now_ms;
            state.samples.prune(now_ms);
            state.current_speed_bps = self.rate.current_speed(&state.samples, now_ms);
            (state.current_speed_bps, state.total_bytes, created)
        };

        if created {
            self.backfill.request(entity_id);
        }

        self.daily.add(bytes, utc_date(arrived_ms))?;

        if self.focus.active_entity() == Some(entity_id) {
            if let Some(sink) = self.badge.as_mut() {
                sink.set_badge(&Badge::for_speed(entity_id, current_speed_bps));
            }
        }

        Ok(Ingested::Recorded { entity_id, bytes, current_speed_bps, total_bytes, created })
    }

    /// Apply the result of a metadata lookup. A tab removed in the meantime
    /// stays removed.
    pub fn apply_backfill(&mut self, entity_id: EntityId, result: Result<EntityInfo, LookupError>) {
        match result {
            Ok(info) => {
                if !self.registry.update_metadata(entity_id, info.url.as_deref(), info.title.as_deref()) {
                    trace!(tab = entity_id, "Backfill for removed tab ignored");
                }
            }
            Err(e) => warn!(tab = entity_id, error = %e, "Error updating tab info"),
        }
    }
}
