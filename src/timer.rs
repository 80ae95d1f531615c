//! Millisecond tick source driving named countdown timers and repeating
//! task callbacks, grounded on the stack's original `StackTimer` design: a
//! single worker thread ticking once a millisecond, decrementing everything
//! it owns and firing what reaches zero.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration as StdDuration;

use log::warn;

/// Identifies a registered [`TimerTask`] so it can be cancelled before it
/// naturally expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

/// A predicate checked before the countdown-complete check on every tick;
/// when it returns true the task fires no more times, its remaining delay
/// is forced to zero, and it is reaped on the same tick.
pub type StopPredicate = Box<dyn Fn() -> bool + Send>;
type Callback = Box<dyn FnMut() + Send>;

struct Task {
    callback: Callback,
    base_delay_ms: i64,
    remaining_ms: i64,
    exponential: bool,
    exp_shift: u32,
    repeat: i32,
    stop: Option<StopPredicate>,
}

/// Result of advancing a task's countdown, decided while still holding the
/// timer's lock, before any callback runs.
enum TickOutcome {
    Pending,
    ReapWithoutFiring,
    Fire,
}

impl Task {
    /// Advance by one millisecond without invoking the callback. Callbacks
    /// routinely call back into `StackTimer` (a session's FSM tick can
    /// register its own retransmit timer); running one while the timer's
    /// lock is held would deadlock on a second `lock()` from the same
    /// thread, so firing is split into this lock-held half and
    /// `fire_and_reschedule`, called after the lock is released.
    fn pre_tick(&mut self) -> TickOutcome {
        self.remaining_ms -= 1;

        if let Some(stop) = &self.stop {
            if stop() {
                self.remaining_ms = 0;
                return TickOutcome::ReapWithoutFiring;
            }
        }

        if self.remaining_ms > 0 {
            TickOutcome::Pending
        } else {
            TickOutcome::Fire
        }
    }

    /// Invoke the callback and advance repeat bookkeeping. Returns `true` if
    /// the task should be reaped.
    fn fire_and_reschedule(&mut self) -> bool {
        let fire = panic::catch_unwind(AssertUnwindSafe(|| (self.callback)()));
        if fire.is_err() {
            warn!("stack timer: task callback panicked, continuing");
        }

        if self.repeat == 0 {
            return true;
        }
        if self.repeat > 0 {
            self.repeat -= 1;
        }

        self.remaining_ms = if self.exponential {
            self.base_delay_ms << self.exp_shift
        } else {
            self.base_delay_ms
        };
        self.exp_shift += 1;
        false
    }
}

struct Inner {
    tasks: HashMap<u64, Task>,
    timers: HashMap<String, i64>,
}

/// A single-threaded 1 ms tick source shared across the stack via `Arc`.
pub struct StackTimer {
    inner: Mutex<Inner>,
    next_task_id: AtomicU64,
    running: Arc<std::sync::atomic::AtomicBool>,
}

impl StackTimer {
    pub fn new() -> Arc<StackTimer> {
        Arc::new(StackTimer {
            inner: Mutex::new(Inner {
                tasks: HashMap::new(),
                timers: HashMap::new(),
            }),
            next_task_id: AtomicU64::new(1),
            running: Arc::new(std::sync::atomic::AtomicBool::new(true)),
        })
    }

    /// Spawn the tick thread. Call once per process.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let timer = Arc::clone(self);
        thread::spawn(move || {
            while timer.running.load(Ordering::Relaxed) {
                timer.tick_all();
                thread::sleep(StdDuration::from_millis(1));
            }
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    fn tick_all(&self) {
        let mut due = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

            inner.timers.retain(|_, remaining| {
                *remaining -= 1;
                *remaining > 0
            });

            let ids: Vec<u64> = inner.tasks.keys().copied().collect();
            for id in ids {
                match inner.tasks.get_mut(&id).unwrap().pre_tick() {
                    TickOutcome::Pending => {}
                    TickOutcome::ReapWithoutFiring => {
                        inner.tasks.remove(&id);
                    }
                    TickOutcome::Fire => {
                        due.push((id, inner.tasks.remove(&id).unwrap()));
                    }
                }
            }
        }

        // Callbacks run with the timer unlocked: they may themselves call
        // register_task/register_timer on this same StackTimer.
        for (id, mut task) in due {
            if !task.fire_and_reschedule() {
                self.inner
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .tasks
                    .insert(id, task);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn register_task(
        &self,
        callback: impl FnMut() + Send + 'static,
        base_delay_ms: i64,
        exponential: bool,
        repeat: i32,
        stop: Option<StopPredicate>,
    ) -> TaskHandle {
        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let task = Task {
            callback: Box::new(callback),
            base_delay_ms,
            remaining_ms: base_delay_ms,
            exponential,
            exp_shift: 0,
            repeat,
            stop,
        };
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .tasks
            .insert(id, task);
        TaskHandle(id)
    }

    /// Remove a task before it naturally expires.
    pub fn cancel_task(&self, handle: TaskHandle) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .tasks
            .remove(&handle.0);
    }

    /// Arm (or rearm) a named countdown timer, overwriting any prior timer
    /// of the same name.
    pub fn register_timer(&self, name: impl Into<String>, timeout_ms: i64) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .timers
            .insert(name.into(), timeout_ms);
    }

    /// True iff no timer with this name exists, or it has already counted
    /// down to zero.
    pub fn timer_expired(&self, name: &str) -> bool {
        match self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .timers
            .get(name)
        {
            Some(&remaining) => remaining <= 0,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn named_timer_overwrites_prior() {
        let timer = StackTimer::new();
        timer.register_timer("x", 1000);
        timer.register_timer("x", 5);
        assert!(!timer.timer_expired("x"));
        timer.tick_all();
        timer.tick_all();
        timer.tick_all();
        timer.tick_all();
        timer.tick_all();
        assert!(timer.timer_expired("x"));
    }

    #[test]
    fn missing_timer_is_expired() {
        let timer = StackTimer::new();
        assert!(timer.timer_expired("nope"));
    }

    #[test]
    fn task_fires_after_delay_and_reaps_when_repeat_zero() {
        let timer = StackTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        timer.register_task(move || { fired_clone.fetch_add(1, Ordering::SeqCst); }, 3, false, 0, None);

        for _ in 0..2 {
            timer.tick_all();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        timer.tick_all();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // reaped: further ticks must not fire again
        for _ in 0..10 {
            timer.tick_all();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exponential_backoff_doubles_each_fire() {
        let timer = StackTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        timer.register_task(
            move || { fired_clone.fetch_add(1, Ordering::SeqCst); },
            2,
            true,
            -1,
            None,
        );

        for _ in 0..2 {
            timer.tick_all();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // next delay is base << 1 == 4
        for _ in 0..3 {
            timer.tick_all();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        timer.tick_all();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn callback_can_reenter_timer_without_deadlocking() {
        let timer = StackTimer::new();
        let reentered = Arc::new(AtomicUsize::new(0));
        let reentered_clone = Arc::clone(&reentered);
        let timer_clone = Arc::clone(&timer);
        timer.register_task(
            move || {
                timer_clone.register_timer("reentrant", 5);
                timer_clone.register_task(|| {}, 1, false, 0, None);
                reentered_clone.fetch_add(1, Ordering::SeqCst);
            },
            1,
            false,
            0,
            None,
        );
        timer.tick_all();
        assert_eq!(reentered.load(Ordering::SeqCst), 1);
        assert!(!timer.timer_expired("reentrant"));
    }

    #[test]
    fn stop_predicate_halts_before_countdown_fires() {
        let timer = StackTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let stop: StopPredicate = Box::new(|| true);
        timer.register_task(
            move || { fired_clone.fetch_add(1, Ordering::SeqCst); },
            1000,
            false,
            -1,
            Some(stop),
        );
        timer.tick_all();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_task_prevents_future_fires() {
        let timer = StackTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let handle = timer.register_task(
            move || { fired_clone.fetch_add(1, Ordering::SeqCst); },
            2,
            false,
            -1,
            None,
        );
        timer.cancel_task(handle);
        for _ in 0..10 {
            timer.tick_all();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_callback_does_not_poison_timer() {
        let timer = StackTimer::new();
        timer.register_task(|| panic!("boom"), 1, false, 0, None);
        timer.tick_all();
        // the timer itself must still be usable afterwards
        timer.register_timer("after-panic", 5);
        assert!(!timer.timer_expired("after-panic"));
        let _ = Duration::from_millis(0);
    }
}
