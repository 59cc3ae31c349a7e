use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::daily::DailyView;
use crate::state::{EntityRegistry, TabRecord};

/// Queries the presentation layer may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    #[serde(rename = "GET_TAB_TRAFFIC")]
    GetTabTraffic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub tabs: Vec<TabRecord>,
    pub daily_total: u64,
}

/// Read-only view over the registry and daily counter. Never mutates
/// either, so any number of pollers can hold one.
#[derive(Clone)]
pub struct SnapshotProvider {
    registry: Arc<EntityRegistry>,
    daily: Arc<DailyView>,
}

impl SnapshotProvider {
    pub fn new(registry: Arc<EntityRegistry>, daily: Arc<DailyView>) -> Self {
        Self { registry, daily }
    }

    pub fn get_snapshot(&self, today: NaiveDate) -> Snapshot {
        Snapshot { tabs: self.registry.snapshot_all(), daily_total: self.daily.total(today) }
    }

    pub fn handle(&self, request: Request, today: NaiveDate) -> Snapshot {
        match request {
            Request::GetTabTraffic => self.get_snapshot(today),
        }
    }
}
