use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::store::{KeyValueStore, StoreError};

pub const DAILY_KEY: &str = "dailyTraffic";

/// Calendar date in UTC for a millisecond epoch timestamp.
pub fn utc_date(timestamp_ms: i64) -> NaiveDate {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .map(|dt| dt.date_naive())
        .unwrap_or(NaiveDate::MIN)
}

pub fn today_utc() -> NaiveDate {
    Utc::now().date_naive()
}

/// Persisted shape of the counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyTraffic {
    #[serde(with = "date_key")]
    pub date: NaiveDate,
    pub total_bytes: u64,
}

impl DailyTraffic {
    pub fn fresh(today: NaiveDate) -> Self {
        Self { date: today, total_bytes: 0 }
    }
}

mod date_key {
    use chrono::NaiveDate;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%d";

    pub fn serialize<S: Serializer>(date: &NaiveDate, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&date.format(FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDate, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveDate::parse_from_str(&raw, FORMAT).map_err(serde::de::Error::custom)
    }
}

/// Read side of the counter, shared with pollers. Only the owning
/// [`DailyCounter`] writes to it.
#[derive(Debug, Default)]
pub struct DailyView {
    day: AtomicI32,
    total: AtomicU64,
}

impl DailyView {
    fn publish(&self, state: &DailyTraffic) {
        self.total.store(state.total_bytes, Ordering::Relaxed);
        self.day.store(state.date.num_days_from_ce(), Ordering::Release);
    }

    /// Total for `today`; a counter still keyed to another day reads as 0.
    pub fn total(&self, today: NaiveDate) -> u64 {
        if self.day.load(Ordering::Acquire) != today.num_days_from_ce() {
            return 0;
        }
        self.total.load(Ordering::Relaxed)
    }
}

/// Date-keyed running total persisted through a [`KeyValueStore`].
///
/// `add` takes `&mut self` and finishes its write before returning, so two
/// read-modify-write cycles can never interleave.
pub struct DailyCounter {
    store: Box<dyn KeyValueStore>,
    state: DailyTraffic,
    view: Arc<DailyView>,
}

impl DailyCounter {
    /// Load the stored counter, or start from zero if nothing usable is there.
    pub fn load_or_init(store: Box<dyn KeyValueStore>, today: NaiveDate) -> Self {
        let stored = match store.get(DAILY_KEY) {
            Ok(Some(value)) => match serde_json::from_value::<DailyTraffic>(value) {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!(error = %e, "Stored daily counter is malformed; starting fresh");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Failed to read daily counter; starting fresh");
                None
            }
        };

        let created = stored.is_none();
        let mut counter = Self {
            store,
            state: stored.unwrap_or_else(|| DailyTraffic::fresh(today)),
            view: Arc::new(DailyView::default()),
        };
        // a stored key from any other day, earlier or skewed ahead, is stale
        if counter.state.date != today {
            counter.reset(today);
        }
        counter.view.publish(&counter.state);

        if created {
            // create-if-absent; a failure here is retried by the next add
            if let Err(e) = counter.persist() {
                warn!(error = %e, "Failed to initialise daily counter in store");
            }
        }
        info!(date = %counter.state.date, total_bytes = counter.state.total_bytes, "Daily counter ready");
        counter
    }

    fn reset(&mut self, day: NaiveDate) {
        debug!(from = %self.state.date, to = %day, dropped = self.state.total_bytes, "Daily counter rolled over");
        self.state = DailyTraffic::fresh(day);
    }

    /// Forward-only: a day at or before the current key leaves it in place.
    fn roll_over(&mut self, day: NaiveDate) -> bool {
        if day <= self.state.date {
            return false;
        }
        self.reset(day);
        true
    }

    fn persist(&mut self) -> Result<(), StoreError> {
        let value = serde_json::to_value(&self.state)?;
        self.store.set(DAILY_KEY, value)
    }

    /// Roll over if `day` is newer than the current key, increment, then
    /// persist.
    ///
    /// Bytes dated before the current key are counted toward the current
    /// key; late deliveries never move the counter back a day.
    ///
    /// The in-memory total is updated even if the write fails; the error is
    /// returned so the caller can log it, and the next add writes the full
    /// value again.
    pub fn add(&mut self, bytes: u64, day: NaiveDate) -> Result<u64, StoreError> {
        self.roll_over(day);
        self.state.total_bytes = self.state.total_bytes.saturating_add(bytes);
        self.view.publish(&self.state);
        self.persist()?;
        Ok(self.state.total_bytes)
    }

    pub fn total(&self, today: NaiveDate) -> u64 {
        if self.state.date == today {
            self.state.total_bytes
        } else {
            0
        }
    }

    pub fn state(&self) -> &DailyTraffic {
        &self.state
    }

    pub fn view(&self) -> Arc<DailyView> {
        Arc::clone(&self.view)
    }
}

/// Read the persisted counter without taking ownership of it.
pub fn read_persisted(store: &dyn KeyValueStore, today: NaiveDate) -> Result<DailyTraffic, StoreError> {
    let state = match store.get(DAILY_KEY)? {
        Some(value) => serde_json::from_value::<DailyTraffic>(value)?,
        None => DailyTraffic::fresh(today),
    };
    if state.date != today {
        return Ok(DailyTraffic::fresh(today));
    }
    Ok(state)
}
