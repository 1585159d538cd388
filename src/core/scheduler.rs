//! # Tracked schedulers.
//!
//! A [`Scheduler`] is a named async loop that decides *when* a unit of work
//! runs; the work itself always runs on the pool's blocking workers.
//!
//! ## Loop shapes
//! ```text
//! once:      sleep(delay) ─► run ─► exit
//! periodic:  tick(initial, period) ─► until()? ─► run ─► failed? ─► exit
//!                 ▲                                         │ no
//!                 └─────────────────────────────────────────┘
//! daily/weekly: sleep(until next wall-clock occurrence) ─► until()? ─► run ─► ...
//! ```
//! Every loop selects on its cancellation token at each await point.
//!
//! ## Rules
//! - Creation broadcasts `SCHEDULER_REGISTER`; leaving the tracked set broadcasts
//!   `SCHEDULER_UNREGISTER`.
//! - A failed run ends the scheduler; the failure itself is escalated by the task handle.
//! - Shutdown: cancel all, await up to the timeout, abort stragglers, await again, log leftovers.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{Datelike, Local, NaiveDateTime, NaiveTime, TimeDelta, Weekday};
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::pool::Pool;
use crate::context::Context;
use crate::error::{BoxError, RuntimeError, panic_message};
use crate::events::{SCHEDULER_REGISTER, SCHEDULER_UNREGISTER};

/// Predicate checked before each periodic run; `true` stops the scheduler.
pub type StopPredicate = Arc<dyn Fn() -> bool + Send + Sync + 'static>;

const MIN_PERIOD: Duration = Duration::from_millis(1);
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + delay`, clamped for delays the clock cannot represent.
fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE)
}

/// When a scheduler fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleKind {
    Once { delay: Duration },
    Periodic { initial: Duration, period: Duration },
    Daily { at: NaiveTime },
    Weekly { day: Weekday, at: NaiveTime },
}

/// Handle to a tracked scheduler.
pub struct Scheduler {
    id: u64,
    name: String,
    kind: ScheduleKind,
    token: CancellationToken,
    join: Mutex<Option<JoinHandle<()>>>,
    terminated: AtomicBool,
    runs: AtomicU64,
}

impl Scheduler {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ScheduleKind {
        self.kind
    }

    /// Completed runs.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Acquire)
    }

    /// True once the loop exited.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Requests the loop to stop; a run in progress finishes on its own.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// Next wall-clock occurrence of `at` (on `day`, if given) strictly after `now`.
pub fn next_occurrence(now: NaiveDateTime, at: NaiveTime, day: Option<Weekday>) -> NaiveDateTime {
    let mut next = now.date().and_time(at);
    match day {
        Some(day) => {
            let ahead = (7 + i64::from(day.num_days_from_monday())
                - i64::from(now.weekday().num_days_from_monday()))
                % 7;
            next += TimeDelta::days(ahead);
            if next <= now {
                next += TimeDelta::days(7);
            }
        }
        None => {
            if next <= now {
                next += TimeDelta::days(1);
            }
        }
    }
    next
}

fn until_next(at: NaiveTime, day: Option<Weekday>) -> Duration {
    let now = Local::now().naive_local();
    (next_occurrence(now, at, day) - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

fn should_stop(until: &Option<StopPredicate>) -> bool {
    let Some(until) = until else {
        return false;
    };
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| until())) {
        Ok(stop) => stop,
        Err(payload) => {
            tracing::warn!(info = %panic_message(payload.as_ref()), "stop predicate panicked; stopping");
            true
        }
    }
}

/// Hands one run to the pool and waits for it; `false` ends the loop.
async fn run_on_pool<F>(scheduler: &Scheduler, ctx: &Context, task: F) -> bool
where
    F: FnOnce(&Context) -> Result<(), BoxError> + Send + 'static,
{
    let handle = match ctx.run(task) {
        Ok(handle) => handle,
        Err(err) => {
            tracing::debug!(scheduler = scheduler.name(), error = %err, "run not scheduled");
            return false;
        }
    };
    tokio::select! {
        _ = scheduler.token.cancelled() => false,
        _ = handle.finished() => {
            scheduler.runs.fetch_add(1, Ordering::AcqRel);
            handle.error().is_none()
        }
    }
}

/// Set of tracked schedulers.
#[derive(Clone)]
pub(crate) struct Schedulers {
    tracked: Arc<ArcSwap<Vec<Arc<Scheduler>>>>,
    next_id: Arc<AtomicU64>,
}

impl Schedulers {
    pub(crate) fn new() -> Self {
        Self {
            tracked: Arc::new(ArcSwap::from_pointee(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub(crate) fn all(&self) -> Vec<Arc<Scheduler>> {
        self.tracked.load().iter().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.tracked.load().len()
    }

    fn untrack(&self, scheduler: &Arc<Scheduler>) -> bool {
        let mut removed = false;
        self.tracked.rcu(|current| {
            removed = current.iter().any(|s| Arc::ptr_eq(s, scheduler));
            current
                .iter()
                .filter(|s| !Arc::ptr_eq(s, scheduler))
                .cloned()
                .collect::<Vec<_>>()
        });
        removed
    }

    /// Drops terminated schedulers from the tracked set.
    pub(crate) fn sweep(&self, ctx: &Context) -> usize {
        let finished: Vec<Arc<Scheduler>> = self
            .tracked
            .load()
            .iter()
            .filter(|s| s.is_terminated() || s.join.lock().as_ref().is_some_and(JoinHandle::is_finished))
            .cloned()
            .collect();
        for scheduler in &finished {
            if self.untrack(scheduler) {
                announce(ctx, SCHEDULER_UNREGISTER, scheduler);
            }
        }
        finished.len()
    }

    fn launch<Fut>(
        &self,
        pool: &Pool,
        ctx: &Context,
        name: &str,
        kind: ScheduleKind,
        body: impl FnOnce(Arc<Scheduler>, Context) -> Fut,
    ) -> Result<Arc<Scheduler>, RuntimeError>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let scheduler = Arc::new(Scheduler {
            id,
            name: format!("{name}#{id}"),
            kind,
            token: CancellationToken::new(),
            join: Mutex::new(None),
            terminated: AtomicBool::new(false),
            runs: AtomicU64::new(0),
        });

        self.tracked.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(Arc::clone(&scheduler));
            next
        });
        announce(ctx, SCHEDULER_REGISTER, &scheduler);

        let body = body(Arc::clone(&scheduler), ctx.clone());
        let retire = Retire {
            set: self.clone(),
            scheduler: Arc::clone(&scheduler),
            owner: ctx.clone(),
        };
        let spawned = pool.spawn(async move {
            let _retire = retire;
            body.await;
        });

        match spawned {
            Ok(join) => {
                *scheduler.join.lock() = Some(join);
                Ok(scheduler)
            }
            Err(err) => {
                scheduler.terminated.store(true, Ordering::Release);
                self.untrack(&scheduler);
                Err(err)
            }
        }
    }

    /// One-shot after `delay`.
    pub(crate) fn once<F>(
        &self,
        pool: &Pool,
        ctx: &Context,
        name: &str,
        delay: Duration,
        task: F,
    ) -> Result<Arc<Scheduler>, RuntimeError>
    where
        F: FnOnce(&Context) -> Result<(), BoxError> + Send + 'static,
    {
        self.launch(pool, ctx, name, ScheduleKind::Once { delay }, move |me, ctx| async move {
            tokio::select! {
                _ = me.token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            run_on_pool(&me, &ctx, task).await;
        })
    }

    /// Fixed-rate loop.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn periodic<F>(
        &self,
        pool: &Pool,
        ctx: &Context,
        name: &str,
        initial: Duration,
        period: Duration,
        task: F,
        until: Option<StopPredicate>,
    ) -> Result<Arc<Scheduler>, RuntimeError>
    where
        F: Fn(&Context) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let period = period.max(MIN_PERIOD);
        let task = Arc::new(task);
        let kind = ScheduleKind::Periodic { initial, period };
        self.launch(pool, ctx, name, kind, move |me, ctx| async move {
            let mut ticker = tokio::time::interval_at(deadline_after(initial), period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = me.token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if should_stop(&until) {
                    break;
                }
                let task = Arc::clone(&task);
                if !run_on_pool(&me, &ctx, move |c| (*task)(c)).await {
                    break;
                }
            }
        })
    }

    /// Daily (`day = None`) or weekly wall-clock loop in local time.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn wall_clock<F>(
        &self,
        pool: &Pool,
        ctx: &Context,
        name: &str,
        at: NaiveTime,
        day: Option<Weekday>,
        task: F,
        until: Option<StopPredicate>,
    ) -> Result<Arc<Scheduler>, RuntimeError>
    where
        F: Fn(&Context) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let task = Arc::new(task);
        let kind = match day {
            Some(day) => ScheduleKind::Weekly { day, at },
            None => ScheduleKind::Daily { at },
        };
        self.launch(pool, ctx, name, kind, move |me, ctx| async move {
            loop {
                let wait = until_next(at, day);
                tokio::select! {
                    _ = me.token.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                if should_stop(&until) {
                    break;
                }
                let task = Arc::clone(&task);
                if !run_on_pool(&me, &ctx, move |c| (*task)(c)).await {
                    break;
                }
            }
        })
    }

    /// Cancels every tracked scheduler and waits for the loops to exit.
    ///
    /// Must be called from outside the pool's async workers.
    pub(crate) fn shutdown(&self, pool: &Pool, timeout: Duration) {
        let all: Vec<Arc<Scheduler>> = self.tracked.swap(Arc::new(Vec::new())).iter().cloned().collect();
        for scheduler in &all {
            scheduler.cancel();
        }
        let mut joins: Vec<(Arc<Scheduler>, JoinHandle<()>)> = all
            .iter()
            .filter_map(|s| s.join.lock().take().map(|j| (Arc::clone(s), j)))
            .collect();
        if joins.is_empty() || pool.is_closed() {
            return;
        }

        let in_time = pool.block_on(async {
            tokio::time::timeout(timeout, join_all(joins.iter_mut().map(|(_, j)| j)))
                .await
                .is_ok()
        });
        if in_time {
            return;
        }

        for (scheduler, join) in &joins {
            if !join.is_finished() {
                tracing::debug!(scheduler = scheduler.name(), "aborting scheduler");
                join.abort();
            }
        }
        pool.block_on(async {
            let pending = joins
                .iter_mut()
                .filter(|(_, j)| !j.is_finished())
                .map(|(_, j)| j);
            let _ = tokio::time::timeout(timeout, join_all(pending)).await;
        });
        for (scheduler, join) in &joins {
            if !join.is_finished() {
                tracing::warn!(scheduler = scheduler.name(), "scheduler did not stop in time");
            }
        }
    }
}

/// Marks the loop terminated and leaves the tracked set when the loop future
/// is dropped, whether it returned, panicked or was aborted.
struct Retire {
    set: Schedulers,
    scheduler: Arc<Scheduler>,
    owner: Context,
}

impl Drop for Retire {
    fn drop(&mut self) {
        self.scheduler.terminated.store(true, Ordering::Release);
        if self.set.untrack(&self.scheduler) {
            announce(&self.owner, SCHEDULER_UNREGISTER, &self.scheduler);
        }
    }
}

fn announce(ctx: &Context, channel: crate::events::ChannelId, scheduler: &Arc<Scheduler>) {
    let sent = ctx
        .new_event(channel)
        .payload(Arc::clone(scheduler))
        .broadcast(true)
        .asynchronous(true)
        .send();
    if let Err(err) = sent {
        tracing::debug!(scheduler = scheduler.name(), error = %err, "scheduler announcement dropped");
    }
}
