// ── Background scheduler ──
//
// One loop per active hub. Each pass repairs the cache (full refresh or
// per-resource refresh of stale entries), then runs the user tasks that
// are due. Failures are logged and never end the loop; only a stale
// lifecycle token does.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::CoreError;
use crate::hub::{Hub, HubInner};
use crate::lifecycle::LifecycleToken;

/// Future returned by a task callback.
pub type TaskFuture = BoxFuture<'static, Result<(), CoreError>>;

/// A periodic task callback. Receives a handle to the hub that runs it.
pub type TaskFn = Arc<dyn Fn(Hub) -> TaskFuture + Send + Sync>;

// ── Task table ───────────────────────────────────────────────────────

struct TaskEntry {
    serial: u64,
    interval: Duration,
    /// `None` once the next run lies beyond what `Instant` can represent.
    next_due: Option<Instant>,
    callback: TaskFn,
}

/// A task claimed for one run.
pub(crate) struct DueTask {
    pub(crate) id: String,
    serial: u64,
    callback: TaskFn,
}

/// Registered tasks by id.
///
/// Every registration gets a fresh serial so a run that finishes after
/// its task was replaced or ended cannot reschedule the newcomer.
#[derive(Default)]
pub(crate) struct TaskTable {
    tasks: DashMap<String, TaskEntry>,
    serial: AtomicU64,
}

impl TaskTable {
    /// Register `callback` under `id`, replacing any existing task. Due now.
    pub(crate) fn insert(&self, id: impl Into<String>, interval: Duration, callback: TaskFn) {
        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        self.tasks.insert(
            id.into(),
            TaskEntry {
                serial,
                interval,
                next_due: Some(Instant::now()),
                callback,
            },
        );
    }

    /// Remove the task with `id`. Returns whether one existed.
    pub(crate) fn remove(&self, id: &str) -> bool {
        self.tasks.remove(id).is_some()
    }

    /// Claim every task due at `now`, pushing its due time one interval out
    /// so a concurrent pass does not run it again.
    pub(crate) fn claim_due(&self, now: Instant) -> Vec<DueTask> {
        let mut due = Vec::new();
        for mut entry in self.tasks.iter_mut() {
            if entry.next_due.is_none_or(|due| due > now) {
                continue;
            }
            entry.next_due = now.checked_add(entry.interval);
            due.push(DueTask {
                id: entry.key().clone(),
                serial: entry.serial,
                callback: Arc::clone(&entry.callback),
            });
        }
        due
    }

    /// Schedule the next run of a finished task one interval after `finished`.
    /// A task replaced or removed in the meantime is left alone.
    pub(crate) fn reschedule(&self, task: &DueTask, finished: Instant) {
        if let Some(mut entry) = self.tasks.get_mut(&task.id) {
            if entry.serial == task.serial {
                entry.next_due = finished.checked_add(entry.interval);
                if entry.next_due.is_none() {
                    tracing::debug!(task = %task.id, "interval out of range, task parked");
                }
            }
        }
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

// ── Refresh policy ───────────────────────────────────────────────────

/// Whether a pass should do a full refresh rather than per-resource repair.
pub(crate) fn wants_full_refresh(
    last_refresh: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    refresh_interval: Duration,
    stale: usize,
    stale_threshold: usize,
) -> bool {
    let Some(last) = last_refresh else {
        return true;
    };
    let overdue = (now - last)
        .to_std()
        .is_ok_and(|age| age > refresh_interval);
    overdue || stale > stale_threshold
}

/// Holds off full refreshes for a while after one fails.
#[derive(Debug, Default)]
pub(crate) struct RefreshBackoff {
    failed_at: Mutex<Option<Instant>>,
}

impl RefreshBackoff {
    pub(crate) fn ready(&self, now: Instant, delay: Duration) -> bool {
        self.failed_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none_or(|at| now.duration_since(at) >= delay)
    }

    pub(crate) fn record(&self, failed_at: Option<Instant>) {
        *self.failed_at.lock().unwrap_or_else(PoisonError::into_inner) = failed_at;
    }
}

// ── Pass ─────────────────────────────────────────────────────────────

/// One scheduler pass: cache repair, then due tasks.
pub(crate) async fn run_pass(hub: &Hub) {
    repair(hub).await;
    run_due_tasks(hub).await;
}

async fn repair(hub: &Hub) {
    let inner = hub.inner();
    let config = &inner.config;
    let now = Utc::now();
    let stale = inner.store.stale(now);

    if wants_full_refresh(
        inner.store.last_refresh(),
        now,
        config.refresh_interval,
        stale.len(),
        config.stale_refresh_threshold,
    ) {
        let clock = Instant::now();
        if !inner.refresh_backoff.ready(clock, config.refresh_retry_delay) {
            return;
        }
        match hub.refresh().await {
            Ok(_) => inner.refresh_backoff.record(None),
            Err(e) => {
                tracing::warn!(error = %e, "scheduled refresh failed");
                inner.refresh_backoff.record(Some(clock));
            }
        }
        return;
    }

    if !stale.is_empty() {
        tracing::debug!(count = stale.len(), "refreshing stale resources");
        for update in inner.store.refresh_each(&stale).await {
            hub.publish_update(&update);
        }
    }
}

async fn run_due_tasks(hub: &Hub) {
    let tasks = &hub.inner().tasks;
    for task in tasks.claim_due(Instant::now()) {
        let run = (task.callback)(hub.clone());
        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(task = %task.id, error = %e, "task failed"),
            Err(_) => tracing::error!(task = %task.id, "task panicked"),
        }
        tasks.reschedule(&task, Instant::now());
    }
}

// ── Loop ─────────────────────────────────────────────────────────────

const MIN_TICK: Duration = Duration::from_millis(1);

/// Run passes every `tick` until `token` goes stale or the hub is dropped.
pub(crate) async fn scheduler_loop(weak: Weak<HubInner>, token: LifecycleToken, tick: Duration) {
    let mut interval = tokio::time::interval(tick.max(MIN_TICK));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::debug!(generation = token.generation(), "scheduler started");

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            _ = interval.tick() => {}
        }
        if !token.is_current() {
            break;
        }
        let Some(hub) = Hub::upgrade(&weak) else {
            break;
        };
        run_pass(&hub).await;
    }

    tracing::debug!(generation = token.generation(), "scheduler stopped");
}
