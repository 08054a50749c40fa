//! Source directory watcher and debounced event collector
//!
//! Raw `notify` events are reduced to [`RawEvent`]s and forwarded over a
//! channel. The [`EventCollector`] maps every event to the top-level entry
//! of the source root it belongs to and keeps one resettable timer task per
//! entry. When a timer fires without being reset, the entry is enqueued
//! exactly once.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{Event, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queues::{EnqueueOutcome, WorkQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEventKind {
    Create,
    Modify,
    Remove,
    Other,
}

/// A filesystem change under the source root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub path: PathBuf,
    pub kind: RawEventKind,
}

impl RawEvent {
    pub fn new(path: impl Into<PathBuf>, kind: RawEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Reduce a notify event to raw events. Access events are dropped so that
/// reading a bundle never counts as activity.
pub fn map_notify_event(event: Event) -> Vec<RawEvent> {
    let kind = match event.kind {
        EventKind::Access(_) => return Vec::new(),
        EventKind::Create(_) => RawEventKind::Create,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => RawEventKind::Create,
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => RawEventKind::Remove,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut paths = event.paths.into_iter();
            let mut events = Vec::with_capacity(2);
            if let Some(from) = paths.next() {
                events.push(RawEvent::new(from, RawEventKind::Remove));
            }
            if let Some(to) = paths.next() {
                events.push(RawEvent::new(to, RawEventKind::Create));
            }
            return events;
        }
        EventKind::Modify(_) => RawEventKind::Modify,
        EventKind::Remove(_) => RawEventKind::Remove,
        EventKind::Any | EventKind::Other => RawEventKind::Other,
    };

    event
        .paths
        .into_iter()
        .map(|path| RawEvent::new(path, kind))
        .collect()
}

/// The top-level entry of `root` that contains `path`
pub fn top_level_of(root: &Path, path: &Path) -> Option<PathBuf> {
    let relative = path.strip_prefix(root).ok()?;
    match relative.components().next()? {
        Component::Normal(first) => Some(root.join(first)),
        _ => None,
    }
}

/// Synthetic create events for everything already in the source root
pub fn scan_existing(root: &Path) -> io::Result<Vec<RawEvent>> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(root)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    entries.sort();
    Ok(entries
        .into_iter()
        .map(|path| RawEvent::new(path, RawEventKind::Create))
        .collect())
}

/// Keeps the underlying notify watcher alive
pub enum FsWatcher {
    Native(RecommendedWatcher),
    Poll(PollWatcher),
}

impl FsWatcher {
    /// Stop delivering events for `root`
    pub fn unwatch(&mut self, root: &Path) -> Result<()> {
        match self {
            Self::Native(watcher) => watcher.unwatch(root),
            Self::Poll(watcher) => watcher.unwatch(root),
        }
        .with_context(|| format!("Failed to unwatch {}", root.display()))
    }
}

fn forward_to(
    tx: mpsc::UnboundedSender<RawEvent>,
) -> impl FnMut(notify::Result<Event>) + Send + 'static {
    move |res| match res {
        Ok(event) => {
            for raw in map_notify_event(event) {
                if tx.send(raw).is_err() {
                    return;
                }
            }
        }
        Err(e) => warn!(error = %e, "Filesystem watcher error"),
    }
}

/// Watch `root` recursively, forwarding raw events to the returned channel.
///
/// A poll interval selects the polling backend, for network mounts and
/// containers where native notifications are unreliable.
pub fn watch_source(
    root: &Path,
    poll_interval: Option<Duration>,
) -> Result<(FsWatcher, mpsc::UnboundedReceiver<RawEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();

    let watcher = match poll_interval {
        Some(interval) => {
            let mut watcher = PollWatcher::new(
                forward_to(tx),
                notify::Config::default().with_poll_interval(interval),
            )
            .context("Failed to create polling watcher")?;
            watcher
                .watch(root, RecursiveMode::Recursive)
                .with_context(|| format!("Failed to watch {}", root.display()))?;
            FsWatcher::Poll(watcher)
        }
        None => {
            let mut watcher = RecommendedWatcher::new(forward_to(tx), notify::Config::default())
                .context("Failed to create filesystem watcher")?;
            watcher
                .watch(root, RecursiveMode::Recursive)
                .with_context(|| format!("Failed to watch {}", root.display()))?;
            FsWatcher::Native(watcher)
        }
    };

    info!(
        root = %root.display(),
        polling = poll_interval.is_some(),
        "Watching source directory"
    );
    Ok((watcher, rx))
}

#[derive(Debug, Clone, Copy)]
pub struct CollectorSettings {
    /// Quiet period after the last event before an item settles
    pub delay: Duration,
    /// Stop tracking an item that keeps changing for longer than this. It
    /// stays ignored until the top-level entry is removed or re-created.
    pub max_tracking: Duration,
}

struct TrackedItem {
    first_seen: Instant,
    last_event: Instant,
    generation: u64,
    timer: JoinHandle<()>,
    /// The top-level entry itself was (re)created while we tracked it
    recreated: bool,
}

/// Turns raw events into one settle signal per top-level entry
pub struct EventCollector {
    root: PathBuf,
    settings: CollectorSettings,
    queue: Arc<WorkQueue>,
    items: HashMap<PathBuf, TrackedItem>,
    abandoned: HashSet<PathBuf>,
    next_generation: u64,
    expiry_tx: mpsc::UnboundedSender<(PathBuf, u64)>,
    expiry_rx: Option<mpsc::UnboundedReceiver<(PathBuf, u64)>>,
}

impl EventCollector {
    pub fn new(root: impl Into<PathBuf>, settings: CollectorSettings, queue: Arc<WorkQueue>) -> Self {
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
        Self {
            root: root.into(),
            settings,
            queue,
            items: HashMap::new(),
            abandoned: HashSet::new(),
            next_generation: 0,
            expiry_tx,
            expiry_rx: Some(expiry_rx),
        }
    }

    /// Number of top-level entries currently debouncing
    pub fn tracked(&self) -> usize {
        self.items.len()
    }

    /// Consume events until cancelled or the event stream ends
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<RawEvent>,
        cancel: CancellationToken,
    ) {
        let Some(mut expiries) = self.expiry_rx.take() else {
            return;
        };

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some((path, generation)) = expiries.recv() => {
                    self.handle_expiry(path, generation);
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
            }
        }

        for (_, item) in self.items.drain() {
            item.timer.abort();
        }
        debug!("Event collector stopped");
    }

    fn handle_event(&mut self, event: RawEvent) {
        let Some(top) = top_level_of(&self.root, &event.path) else {
            return;
        };
        let top_created = event.kind == RawEventKind::Create && event.path == top;

        if self.abandoned.contains(&top) {
            if top_created || (event.kind == RawEventKind::Remove && event.path == top) {
                info!(item = %top.display(), "Abandoned item was replaced, watching it again");
                self.abandoned.remove(&top);
            }
            if !top_created {
                return;
            }
        }

        if !self.items.contains_key(&top) && self.queue.is_active(&top) && !top_created {
            debug!(item = %top.display(), "Ignoring event for item already queued or in flight");
            return;
        }

        let now = Instant::now();
        let generation = self.next_generation;
        self.next_generation += 1;

        if let Some(item) = self.items.get_mut(&top) {
            item.timer.abort();

            if now.duration_since(item.first_seen) >= self.settings.max_tracking {
                warn!(
                    item = %top.display(),
                    tracked_secs = now.duration_since(item.first_seen).as_secs(),
                    "Item never settled, abandoning"
                );
                self.items.remove(&top);
                self.abandoned.insert(top);
                return;
            }

            item.last_event = now;
            item.generation = generation;
            item.recreated |= top_created;
            item.timer = spawn_timer(
                self.expiry_tx.clone(),
                top.clone(),
                generation,
                self.settings.delay,
            );
        } else {
            debug!(item = %top.display(), kind = ?event.kind, "Tracking new item");
            let timer = spawn_timer(
                self.expiry_tx.clone(),
                top.clone(),
                generation,
                self.settings.delay,
            );
            self.items.insert(
                top,
                TrackedItem {
                    first_seen: now,
                    last_event: now,
                    generation,
                    timer,
                    recreated: top_created,
                },
            );
        }
    }

    fn handle_expiry(&mut self, path: PathBuf, generation: u64) -> Option<EnqueueOutcome> {
        // A reset timer may still deliver; only the newest generation counts
        match self.items.get(&path) {
            Some(item) if item.generation == generation => {}
            _ => return None,
        }
        let item = self.items.remove(&path)?;

        if std::fs::symlink_metadata(&path).is_err() {
            debug!(item = %path.display(), "Item disappeared before settling");
            return None;
        }

        let outcome = if item.recreated {
            self.queue.rearm(path.clone())
        } else {
            self.queue.enqueue(path.clone())
        };

        info!(
            item = %path.display(),
            outcome = ?outcome,
            tracked_ms = item.last_event.duration_since(item.first_seen).as_millis() as u64,
            "Item settled"
        );
        Some(outcome)
    }
}

fn spawn_timer(
    tx: mpsc::UnboundedSender<(PathBuf, u64)>,
    path: PathBuf,
    generation: u64,
    delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send((path, generation));
    })
}
