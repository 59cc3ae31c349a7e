use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use crossbeam_channel as channel;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::badge::{format_bytes, format_rate, Badge, BadgeSink};
use crate::cli::{Run, RuntimeConfig};
use crate::daily::{today_utc, DailyCounter};
use crate::event::{parse_line, HostEvent, NO_ENTITY};
use crate::ingest::{BackfillRequester, EntityInfo, EntityLookup, EventIngestor, FocusSource, LookupError};
use crate::snapshot::{Request, Snapshot, SnapshotProvider};
use crate::state::EntityRegistry;
use crate::store::{JsonFileStore, KeyValueStore, MemoryStore};
use crate::window::EntityId;

/// Work for the ingest thread.
#[derive(Debug)]
pub enum Command {
    Host(HostEvent),
    Backfilled { entity_id: EntityId, result: Result<EntityInfo, LookupError> },
    /// Input is exhausted: finish what is queued and stop.
    Drain,
}

/// The host's own view of open tabs, kept current by the event reader and
/// consulted by metadata lookups.
#[derive(Debug, Default)]
pub struct TabDirectory {
    tabs: DashMap<EntityId, EntityInfo>,
}

impl TabDirectory {
    pub fn observe(&self, event: &HostEvent) {
        match event {
            HostEvent::Created { entity_id, url, title } | HostEvent::Updated { entity_id, url, title } => {
                let mut info = self.tabs.entry(*entity_id).or_default();
                if url.is_some() {
                    info.url = url.clone();
                }
                if title.is_some() {
                    info.title = title.clone();
                }
            }
            HostEvent::Removed { entity_id } => {
                self.tabs.remove(entity_id);
            }
            HostEvent::Completed(_) | HostEvent::Activated { .. } => {}
        }
    }
}

impl EntityLookup for TabDirectory {
    fn lookup(&self, entity_id: EntityId) -> Result<EntityInfo, LookupError> {
        self.tabs.get(&entity_id).map(|e| e.value().clone()).ok_or(LookupError::NotFound(entity_id))
    }
}

/// Foreground tab, shared between the reader (writes) and the ingestor (reads).
#[derive(Debug, Clone)]
pub struct SharedFocus(Arc<AtomicI64>);

impl SharedFocus {
    pub fn set(&self, entity_id: EntityId) {
        self.0.store(entity_id, Ordering::Relaxed);
    }
}

impl Default for SharedFocus {
    fn default() -> Self {
        Self(Arc::new(AtomicI64::new(NO_ENTITY)))
    }
}

impl FocusSource for SharedFocus {
    fn active_entity(&self) -> Option<EntityId> {
        let id = self.0.load(Ordering::Relaxed);
        (id != NO_ENTITY).then_some(id)
    }
}

/// How long a drained engine keeps waiting for lookups still in flight.
pub const BACKFILL_GRACE: Duration = Duration::from_secs(2);

/// Lookups requested but not yet applied by the engine.
pub type PendingBackfills = Arc<AtomicUsize>;

/// Runs each lookup on a short-lived worker; the result re-enters the
/// ingest queue so registry writes stay on one thread.
pub struct ThreadBackfill {
    lookup: Arc<dyn EntityLookup>,
    tx: channel::Sender<Command>,
    pending: PendingBackfills,
}

impl ThreadBackfill {
    pub fn new(lookup: Arc<dyn EntityLookup>, tx: channel::Sender<Command>) -> Self {
        Self { lookup, tx, pending: PendingBackfills::default() }
    }

    pub fn pending(&self) -> PendingBackfills {
        Arc::clone(&self.pending)
    }
}

impl BackfillRequester for ThreadBackfill {
    fn request(&mut self, entity_id: EntityId) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        let lookup = Arc::clone(&self.lookup);
        let tx = self.tx.clone();
        thread::spawn(move || {
            let result = lookup.lookup(entity_id);
            // the engine may already be gone on shutdown
            let _ = tx.send(Command::Backfilled { entity_id, result });
        });
    }
}

pub struct LogBadge;

impl BadgeSink for LogBadge {
    fn set_badge(&mut self, badge: &Badge) {
        let [r, g, b] = badge.color;
        info!(tab = badge.entity_id, text = %badge.text, color = %format!("rgb({r}, {g}, {b})"), "Badge");
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn dispatch(ingestor: &mut EventIngestor, focus: &SharedFocus, pending: &AtomicUsize, cmd: Command) -> bool {
    match cmd {
        Command::Host(event) => {
            // focus moves in event order, not when the reader saw the line
            if let HostEvent::Activated { entity_id } = event {
                focus.set(entity_id);
            }
            ingestor.handle(event, now_ms());
            true
        }
        Command::Backfilled { entity_id, result } => {
            ingestor.apply_backfill(entity_id, result);
            let _ = pending.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
            false
        }
        Command::Drain => false,
    }
}

/// After the drain marker: apply lookups still in flight, up to
/// [`BACKFILL_GRACE`]. Returns how many were applied.
fn settle_backfills(
    ingestor: &mut EventIngestor,
    focus: &SharedFocus,
    pending: &AtomicUsize,
    rx: &channel::Receiver<Command>,
) -> u64 {
    let deadline = Instant::now() + BACKFILL_GRACE;
    let mut applied = 0;
    while pending.load(Ordering::Acquire) > 0 {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        match rx.recv_timeout(left) {
            Ok(cmd) => {
                dispatch(ingestor, focus, pending, cmd);
                applied += 1;
            }
            Err(_) => break,
        }
    }
    let outstanding = pending.load(Ordering::Acquire);
    if outstanding > 0 {
        warn!(outstanding, "Tab lookups still pending at shutdown; their metadata is lost");
    }
    applied
}

/// Consume commands until drained or stopped. Returns the ingestor so the
/// caller can inspect final state.
pub fn spawn_engine(
    mut ingestor: EventIngestor,
    focus: SharedFocus,
    pending: PendingBackfills,
    rx: channel::Receiver<Command>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<EventIngestor> {
    thread::spawn(move || {
        let mut processed: u64 = 0;
        loop {
            let cmd = match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(cmd) => cmd,
                Err(channel::RecvTimeoutError::Timeout) => {
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    continue;
                }
                Err(channel::RecvTimeoutError::Disconnected) => break,
            };
            if let Command::Drain = cmd {
                // anything still queued was sent before the drain marker
                while let Ok(cmd) = rx.try_recv() {
                    processed += u64::from(dispatch(&mut ingestor, &focus, &pending, cmd));
                }
                let settled = settle_backfills(&mut ingestor, &focus, &pending, &rx);
                debug!(settled, "Late tab lookups applied");
                break;
            }
            processed += u64::from(dispatch(&mut ingestor, &focus, &pending, cmd));
        }
        debug!(processed, "Ingest loop finished");
        ingestor
    })
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReadStats {
    pub events: u64,
    pub malformed: u64,
}

/// Parse host events line by line and queue them for the ingest thread.
///
/// Lifecycle events update the host-side directory before they are queued,
/// so a lookup triggered by a later event can see them.
pub fn read_events<R: BufRead>(
    reader: R,
    directory: &TabDirectory,
    tx: &channel::Sender<Command>,
    stop: &AtomicBool,
) -> Result<ReadStats> {
    let mut stats = ReadStats::default();
    for (idx, line) in reader.lines().enumerate() {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let line = line.context("Reading event input")?;
        let event = match parse_line(&line) {
            Ok(Some(ev)) => ev,
            Ok(None) => continue,
            Err(e) => {
                warn!(line = idx + 1, error = %e, "Skipping malformed event");
                stats.malformed += 1;
                continue;
            }
        };
        directory.observe(&event);
        if tx.send(Command::Host(event)).is_err() {
            break;
        }
        stats.events += 1;
    }
    Ok(stats)
}

fn spawn_reporter(provider: SnapshotProvider, interval: Duration, stop: Arc<AtomicBool>) {
    thread::spawn(move || {
        let tick = Duration::from_millis(200).min(interval);
        let mut last = Instant::now();
        while !stop.load(Ordering::Relaxed) {
            thread::sleep(tick);
            if last.elapsed() < interval {
                continue;
            }
            last = Instant::now();
            let snap = provider.get_snapshot(today_utc());
            let busiest = snap.tabs.iter().max_by_key(|t| t.current_speed);
            info!(
                tabs = snap.tabs.len(),
                daily_total = %format_bytes(snap.daily_total),
                busiest_tab = busiest.map_or(NO_ENTITY, |t| t.tab_id),
                busiest_speed = %busiest.map(|t| format_rate(t.current_speed)).unwrap_or_default(),
                "Throughput"
            );
        }
    });
}

pub fn run_events(store_path: &Path, run: &Run) -> Result<Snapshot> {
    let config = RuntimeConfig::from(run);

    let stop_flag = Arc::new(AtomicBool::new(false));
    {
        let stop = stop_flag.clone();
        let _ = ctrlc::set_handler(move || {
            stop.store(true, Ordering::Relaxed);
        });
    }

    let source: Box<dyn BufRead + Send> = if run.input == "-" {
        Box::new(BufReader::new(std::io::stdin()))
    } else {
        let file = File::open(&run.input).with_context(|| format!("Opening event input {}", run.input))?;
        Box::new(BufReader::new(file))
    };

    let store: Box<dyn KeyValueStore> = if run.ephemeral {
        Box::new(MemoryStore::new())
    } else {
        let store = JsonFileStore::open(store_path)
            .with_context(|| format!("Opening state store {}", store_path.display()))?;
        Box::new(store)
    };
    let daily = DailyCounter::load_or_init(store, today_utc());
    let registry = Arc::new(EntityRegistry::new());
    let provider = SnapshotProvider::new(Arc::clone(&registry), daily.view());
    info!(store = %store_path.display(), ephemeral = run.ephemeral, input = %run.input, "Starting tabflow");

    let directory = Arc::new(TabDirectory::default());
    let focus = SharedFocus::default();
    let (tx, rx) = channel::bounded::<Command>(config.queue);

    let backfill = ThreadBackfill::new(directory.clone(), tx.clone());
    let pending = backfill.pending();
    let mut ingestor = EventIngestor::new(registry, daily, Box::new(focus.clone()), Box::new(backfill));
    if config.badge {
        ingestor = ingestor.with_badge(Box::new(LogBadge));
    }
    let engine = spawn_engine(ingestor, focus, pending, rx, stop_flag.clone());

    if let Some(interval) = config.report_interval {
        spawn_reporter(provider.clone(), interval, stop_flag.clone());
    }

    // Reader runs detached: on Ctrl-C it may be parked on stdin, and the
    // engine stopping is enough to finish.
    let stop_reader = stop_flag.clone();
    let reader_dir = Arc::clone(&directory);
    let reader = thread::spawn(move || -> Result<ReadStats> {
        let stats = read_events(source, &reader_dir, &tx, &stop_reader);
        let _ = tx.send(Command::Drain);
        stats
    });

    let ingestor = engine.join().map_err(|_| anyhow!("ingest thread panicked"))?;
    let interrupted = stop_flag.swap(true, Ordering::Relaxed);

    if interrupted {
        info!(tabs = ingestor.registry().len(), "Shutting down");
    } else {
        // the engine only drains once the reader is done with its input
        let stats = reader.join().map_err(|_| anyhow!("event reader panicked"))??;
        info!(events = stats.events, malformed = stats.malformed, tabs = ingestor.registry().len(), "Input finished");
    }
    if ingestor.registry().is_empty() {
        debug!("No tab traffic was tracked");
    }
    let daily = ingestor.daily().state();
    info!(date = %daily.date, total_bytes = daily.total_bytes, "Daily counter at exit");

    Ok(provider.handle(Request::GetTabTraffic, today_utc()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daily::tests::{day, SharedStore};
    use crate::event::{Completion, Header};
    use serde_json::json;
    use std::io::Cursor;

    fn completed(entity_id: EntityId, ts: i64, len: u64) -> HostEvent {
        HostEvent::Completed(Completion {
            entity_id,
            timestamp_ms: ts,
            response_headers: Some(vec![Header { name: "content-length".into(), value: Some(len.to_string()) }]),
        })
    }

    struct NoBackfill;

    impl BackfillRequester for NoBackfill {
        fn request(&mut self, _entity_id: EntityId) {}
    }

    #[test]
    fn concurrent_producers_never_lose_daily_updates() {
        let store = SharedStore::default();
        let daily = DailyCounter::load_or_init(Box::new(store.clone()), day("1970-01-01"));
        let view = daily.view();
        let registry = Arc::new(EntityRegistry::new());
        let focus = SharedFocus::default();
        let ingestor = EventIngestor::new(Arc::clone(&registry), daily, Box::new(focus.clone()), Box::new(NoBackfill));

        let (tx, rx) = channel::bounded::<Command>(16);
        let engine = spawn_engine(ingestor, focus, PendingBackfills::default(), rx, Arc::new(AtomicBool::new(false)));

        let producers: Vec<_> = (0..8i64)
            .map(|tab| {
                let tx = tx.clone();
                thread::spawn(move || {
                    let mut sent = 0u64;
                    for i in 0..500i64 {
                        let len = (tab as u64 + 1) * 10 + (i as u64 % 7);
                        tx.send(Command::Host(completed(tab + 1, i * 3, len))).unwrap();
                        sent += len;
                    }
                    sent
                })
            })
            .collect();
        let expected: u64 = producers.into_iter().map(|h| h.join().unwrap()).sum();
        tx.send(Command::Drain).unwrap();
        let ingestor = engine.join().unwrap();

        assert_eq!(ingestor.daily().total(day("1970-01-01")), expected);
        assert_eq!(view.total(day("1970-01-01")), expected);
        assert_eq!(store.persisted(), Some(json!({"date": "1970-01-01", "totalBytes": expected})));
        let per_tab: u64 = registry.snapshot_all().iter().map(|t| t.total_bytes).sum();
        assert_eq!(per_tab, expected);
        assert_eq!(registry.len(), 8);
    }

    #[test]
    fn reader_feeds_directory_and_queue() {
        let input = [
            r#"{"type":"created","tabId":1,"url":"https://a.test/","title":"A"}"#,
            "",
            "garbage",
            r#"{"type":"activated","tabId":1}"#,
            r#"{"type":"completed","tabId":1,"timeStamp":10,"responseHeaders":[{"name":"Content-Length","value":"42"}]}"#,
        ]
        .join("\n");
        let directory = TabDirectory::default();
        let (tx, rx) = channel::unbounded();

        let stats = read_events(Cursor::new(input), &directory, &tx, &AtomicBool::new(false)).unwrap();
        assert_eq!(stats, ReadStats { events: 3, malformed: 1 });
        assert_eq!(directory.lookup(1).unwrap().title.as_deref(), Some("A"));
        assert!(matches!(directory.lookup(2), Err(LookupError::NotFound(2))));
        assert_eq!(rx.try_iter().count(), 3);
    }

    #[test]
    fn backfill_result_reenters_queue_and_fills_metadata() {
        let directory = Arc::new(TabDirectory::default());
        directory.observe(&HostEvent::Created { entity_id: 6, url: Some("https://c.test/".into()), title: Some("C".into()) });

        let daily = DailyCounter::load_or_init(Box::new(SharedStore::default()), day("1970-01-01"));
        let registry = Arc::new(EntityRegistry::new());
        let (tx, rx) = channel::unbounded::<Command>();
        let backfill = ThreadBackfill::new(directory.clone(), tx.clone());
        let mut ingestor =
            EventIngestor::new(Arc::clone(&registry), daily, Box::new(SharedFocus::default()), Box::new(backfill));

        // traffic arrives before the engine ever saw the created event
        ingestor.handle(completed(6, 0, 5), 0);
        let cmd = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let Command::Backfilled { entity_id, result } = cmd else { panic!("expected backfill") };
        ingestor.apply_backfill(entity_id, result);

        let snap = registry.snapshot_all();
        assert_eq!((snap[0].url.as_str(), snap[0].title.as_str()), ("https://c.test/", "C"));
    }

    struct SlowLookup(TabDirectory);

    impl EntityLookup for SlowLookup {
        fn lookup(&self, entity_id: EntityId) -> Result<EntityInfo, LookupError> {
            thread::sleep(Duration::from_millis(100));
            self.0.lookup(entity_id)
        }
    }

    #[test]
    fn drain_waits_for_lookups_in_flight() {
        let directory = TabDirectory::default();
        directory.observe(&HostEvent::Created { entity_id: 9, url: Some("https://d.test/".into()), title: Some("D".into()) });

        let daily = DailyCounter::load_or_init(Box::new(SharedStore::default()), day("1970-01-01"));
        let registry = Arc::new(EntityRegistry::new());
        let focus = SharedFocus::default();
        let (tx, rx) = channel::unbounded::<Command>();
        let backfill = ThreadBackfill::new(Arc::new(SlowLookup(directory)), tx.clone());
        let pending = backfill.pending();
        let ingestor = EventIngestor::new(Arc::clone(&registry), daily, Box::new(focus.clone()), Box::new(backfill));

        // the last event of the input is the first traffic for tab 9
        tx.send(Command::Host(completed(9, 0, 5))).unwrap();
        tx.send(Command::Drain).unwrap();
        spawn_engine(ingestor, focus, Arc::clone(&pending), rx, Arc::new(AtomicBool::new(false))).join().unwrap();

        let snap = registry.snapshot_all();
        assert_eq!((snap[0].url.as_str(), snap[0].title.as_str()), ("https://d.test/", "D"));
        assert_eq!(pending.load(Ordering::Acquire), 0);
    }

    #[test]
    fn directory_tracks_updates_and_removal() {
        let dir = TabDirectory::default();
        dir.observe(&HostEvent::Created { entity_id: 1, url: Some("u1".into()), title: None });
        dir.observe(&HostEvent::Updated { entity_id: 1, url: None, title: Some("t1".into()) });
        assert_eq!(dir.lookup(1).unwrap(), EntityInfo { url: Some("u1".into()), title: Some("t1".into()) });
        dir.observe(&HostEvent::Removed { entity_id: 1 });
        assert!(dir.lookup(1).is_err());
    }

    #[test]
    fn stop_flag_ends_idle_engine() {
        let daily = DailyCounter::load_or_init(Box::new(SharedStore::default()), day("1970-01-01"));
        let focus = SharedFocus::default();
        let ingestor =
            EventIngestor::new(Arc::new(EntityRegistry::new()), daily, Box::new(focus.clone()), Box::new(NoBackfill));
        let (_tx, rx) = channel::unbounded::<Command>();
        let stop = Arc::new(AtomicBool::new(true));
        let engine = spawn_engine(ingestor, focus, PendingBackfills::default(), rx, stop);
        assert!(engine.join().unwrap().registry().is_empty());
    }

    #[derive(Clone, Default)]
    struct BadgeLog(Arc<std::sync::Mutex<Vec<Badge>>>);

    impl BadgeSink for BadgeLog {
        fn set_badge(&mut self, badge: &Badge) {
            self.0.lock().unwrap().push(badge.clone());
        }
    }

    #[test]
    fn badge_follows_focus_in_event_order() {
        let daily = DailyCounter::load_or_init(Box::new(SharedStore::default()), day("1970-01-01"));
        let focus = SharedFocus::default();
        let badges = BadgeLog::default();
        let ingestor =
            EventIngestor::new(Arc::new(EntityRegistry::new()), daily, Box::new(focus.clone()), Box::new(NoBackfill))
                .with_badge(Box::new(badges.clone()));
        let (tx, rx) = channel::unbounded::<Command>();
        // everything is queued before the engine starts
        tx.send(Command::Host(completed(1, 0, 100))).unwrap();
        tx.send(Command::Host(HostEvent::Activated { entity_id: 1 })).unwrap();
        tx.send(Command::Host(completed(1, 10, 2048))).unwrap();
        tx.send(Command::Host(completed(2, 20, 7))).unwrap();
        tx.send(Command::Drain).unwrap();

        spawn_engine(ingestor, focus, PendingBackfills::default(), rx, Arc::new(AtomicBool::new(false))).join().unwrap();
        let badges = badges.0.lock().unwrap();
        assert_eq!(badges.len(), 1);
        assert_eq!(badges[0].entity_id, 1);
        assert_eq!(badges[0].text, "2.1 KB/s");
    }

    #[test]
    fn run_events_replays_file_and_persists_daily_total() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("events.ndjson");
        let store = dir.path().join("state").join("traffic.json");
        let now = Utc::now().timestamp_millis();
        let lines = [
            r#"{"type":"created","tabId":3,"url":"https://a.test/","title":"A"}"#.to_string(),
            format!(r#"{{"type":"completed","tabId":3,"timeStamp":{now},"responseHeaders":[{{"name":"content-length","value":"300"}}]}}"#),
            format!(r#"{{"type":"completed","tabId":-1,"timeStamp":{now},"responseHeaders":[{{"name":"content-length","value":"999"}}]}}"#),
            format!(r#"{{"type":"completed","tabId":4,"timeStamp":{now},"responseHeaders":[{{"name":"content-length","value":"1000"}}]}}"#),
            "not an event".to_string(),
        ];
        std::fs::write(&input, lines.join("\n")).unwrap();

        let run = Run {
            input: input.to_string_lossy().into_owned(),
            report_interval: 0,
            format: crate::cli::OutputFormat::Json,
            queue: 4,
            no_badge: true,
            ephemeral: false,
        };
        let snap = run_events(&store, &run).unwrap();
        let ids: Vec<_> = snap.tabs.iter().map(|t| t.tab_id).collect();
        assert_eq!(ids, vec![4, 3]);
        assert_eq!(snap.tabs[1].title, "A");

        // the JSON store carries the same total the snapshot reported
        let persisted = crate::daily::read_persisted(&JsonFileStore::open(&store).unwrap(), today_utc()).unwrap();
        if persisted.date == crate::daily::utc_date(now) {
            assert_eq!(snap.daily_total, 1300);
            assert_eq!(persisted.total_bytes, 1300);
        }
    }
}
