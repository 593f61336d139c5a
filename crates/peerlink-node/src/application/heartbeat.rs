//! Heartbeat scheduling: one periodic tick, two mutually exclusive jobs.
//!
//! Every tick the node asks [`HeartbeatScheduler::decide`] what to do:
//!
//! ```text
//!  tick ──► pass already running? ──yes──► Skip
//!             │ no
//!             ▼
//!           table empty? ─────────yes──► Skip
//!             │ no
//!             ▼
//!           GC interval elapsed? ─yes──► CollectGarbage
//!             │ no
//!             ▼
//!           ping interval elapsed? yes─► Ping
//!             │ no
//!             ▼
//!            Skip
//! ```
//!
//! # Single flight (for beginners)
//!
//! Ticks are spawned as independent tasks, so a slow pass (for example a bus
//! publish that takes longer than the tick interval) could overlap with the
//! next tick.  [`HeartbeatScheduler::try_begin`] flips an [`AtomicBool`] with
//! `compare_exchange`; only the task that flips it from `false` to `true` gets
//! a [`TickGuard`], and the guard flips it back when dropped.  Everyone else
//! gets `None` and returns immediately.  No lock is ever held.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

/// Shortest allowed garbage-collection interval.
pub const MIN_GC_INTERVAL: Duration = Duration::from_secs(5);
/// Shortest allowed interval between liveness broadcasts.
pub const MIN_PING_INTERVAL: Duration = Duration::from_secs(1);
/// Shortest allowed tick period.
pub const MIN_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// What a tick should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    Skip,
    CollectGarbage,
    Ping,
}

/// Intervals driving the heartbeat, already floored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatIntervals {
    pub ping: Duration,
    pub gc: Duration,
    pub tick: Duration,
}

impl HeartbeatIntervals {
    /// Applies the minimums to raw configured values.
    pub fn floored(ping: Duration, gc: Duration, tick: Duration) -> Self {
        Self {
            ping: ping.max(MIN_PING_INTERVAL),
            gc: gc.max(MIN_GC_INTERVAL),
            tick: tick.max(MIN_TICK_INTERVAL),
        }
    }
}

/// Releases the in-flight flag when dropped.
#[must_use = "the pass ends when the guard is dropped"]
pub struct TickGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct HeartbeatScheduler {
    intervals: HeartbeatIntervals,
    epoch: Instant,
    last_gc_ms: AtomicU64,
    last_ping_ms: AtomicU64,
    in_flight: AtomicBool,
}

impl HeartbeatScheduler {
    /// Creates a scheduler whose first GC and first ping fall one interval
    /// after `epoch`.
    pub fn new(intervals: HeartbeatIntervals, epoch: Instant) -> Self {
        Self {
            intervals,
            epoch,
            last_gc_ms: AtomicU64::new(0),
            last_ping_ms: AtomicU64::new(0),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn intervals(&self) -> HeartbeatIntervals {
        self.intervals
    }

    /// Claims the right to run a pass.  `None` if one is already running.
    pub fn try_begin(&self) -> Option<TickGuard<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TickGuard {
                flag: &self.in_flight,
            })
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Chooses this tick's job and records it as done at `now`.
    ///
    /// Callers hold a [`TickGuard`] while deciding and acting.
    pub fn decide(&self, now: Instant, table_empty: bool) -> TickAction {
        if table_empty {
            return TickAction::Skip;
        }
        let now_ms = self.millis_since_epoch(now);

        let since_gc = now_ms.saturating_sub(self.last_gc_ms.load(Ordering::Acquire));
        if since_gc >= duration_ms(self.intervals.gc) {
            self.last_gc_ms.store(now_ms, Ordering::Release);
            return TickAction::CollectGarbage;
        }

        let since_ping = now_ms.saturating_sub(self.last_ping_ms.load(Ordering::Acquire));
        if since_ping >= duration_ms(self.intervals.ping) {
            self.last_ping_ms.store(now_ms, Ordering::Release);
            return TickAction::Ping;
        }

        TickAction::Skip
    }

    fn millis_since_epoch(&self, now: Instant) -> u64 {
        duration_ms(now.saturating_duration_since(self.epoch))
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
