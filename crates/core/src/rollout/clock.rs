use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;

/// Time source for observation windows and retry backoff.
///
/// Deadlines are absolute so a window persisted before a restart can be
/// resumed by sleeping only for whatever time remains.
#[async_trait]
pub trait RolloutClock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Returns immediately when `deadline` has already passed.
    async fn sleep_until(&self, deadline: DateTime<Utc>);
}

#[derive(Clone, Debug, Default)]
pub struct SystemClock;

#[async_trait]
impl RolloutClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        if let Ok(remaining) = (deadline - Utc::now()).to_std() {
            tokio::time::sleep(remaining).await;
        }
    }
}

/// Hand-driven clock for tests.
///
/// In auto-advance mode every sleep jumps the clock forward to its deadline
/// and returns at once. Otherwise sleepers park until [`ManualClock::advance`]
/// or [`ManualClock::set`] moves time past their deadline.
#[derive(Clone)]
pub struct ManualClock {
    inner: Arc<ManualClockInner>,
}

struct ManualClockInner {
    now: watch::Sender<DateTime<Utc>>,
    sleepers: watch::Sender<usize>,
    auto_advance: bool,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self::build(start, false)
    }

    pub fn auto_advancing(start: DateTime<Utc>) -> Self {
        Self::build(start, true)
    }

    fn build(start: DateTime<Utc>, auto_advance: bool) -> Self {
        let (now, _) = watch::channel(start);
        let (sleepers, _) = watch::channel(0usize);
        Self { inner: Arc::new(ManualClockInner { now, sleepers, auto_advance }) }
    }

    pub fn advance(&self, by: Duration) {
        self.inner.now.send_modify(|now| *now += by);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        self.inner.now.send_modify(|now| {
            if to > *now {
                *now = to;
            }
        });
    }

    pub fn sleeper_count(&self) -> usize {
        *self.inner.sleepers.borrow()
    }

    /// Resolves once at least `count` tasks are parked in `sleep_until`.
    pub async fn wait_for_sleepers(&self, count: usize) {
        let mut sleepers = self.inner.sleepers.subscribe();
        loop {
            if *sleepers.borrow_and_update() >= count {
                return;
            }
            if sleepers.changed().await.is_err() {
                return;
            }
        }
    }
}

impl std::fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualClock")
            .field("now", &*self.inner.now.borrow())
            .field("auto_advance", &self.inner.auto_advance)
            .finish()
    }
}

struct SleeperGuard<'a>(&'a watch::Sender<usize>);

impl<'a> SleeperGuard<'a> {
    fn enter(sleepers: &'a watch::Sender<usize>) -> Self {
        sleepers.send_modify(|count| *count += 1);
        Self(sleepers)
    }
}

impl Drop for SleeperGuard<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|count| *count = count.saturating_sub(1));
    }
}

#[async_trait]
impl RolloutClock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.inner.now.borrow()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        if self.inner.auto_advance {
            self.set(deadline);
            tokio::task::yield_now().await;
            return;
        }

        let mut now = self.inner.now.subscribe();
        let _guard = SleeperGuard::enter(&self.inner.sleepers);
        loop {
            if *now.borrow_and_update() >= deadline {
                return;
            }
            if now.changed().await.is_err() {
                return;
            }
        }
    }
}
