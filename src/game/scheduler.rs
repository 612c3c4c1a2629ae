//! One-shot and repeating timers advanced once per tick

use std::fmt::Display;

use tracing::warn;

/// Handle returned by `wait`/`every`, usable with `cancel`
pub type TimerId = u64;

#[derive(Debug, Clone)]
struct Task<C> {
    id: TimerId,
    remaining: f64,
    period: f64,
    callback: C,
    repeating: bool,
}

/// Pending timer tasks for one room
#[derive(Debug, Clone)]
pub struct Scheduler<C> {
    tasks: Vec<Task<C>>,
    next_id: TimerId,
}

impl<C> Default for Scheduler<C> {
    fn default() -> Self {
        Self {
            tasks: Vec::new(),
            next_id: 0,
        }
    }
}

impl<C: Clone> Scheduler<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire `callback` once after `seconds`
    pub fn wait(&mut self, seconds: f64, callback: C) -> TimerId {
        self.push(seconds, callback, false)
    }

    /// Fire `callback` every `seconds`
    pub fn every(&mut self, seconds: f64, callback: C) -> TimerId {
        self.push(seconds, callback, true)
    }

    pub fn cancel(&mut self, id: TimerId) -> bool {
        let before = self.tasks.len();
        self.tasks.retain(|task| task.id != id);
        self.tasks.len() != before
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Decrement every task and return the callbacks that expired, in
    /// scheduling order. Repeating tasks are re-armed to their period and
    /// one-shot tasks are removed.
    pub fn advance(&mut self, dt: f64) -> Vec<(TimerId, C)> {
        let mut due = Vec::new();
        self.tasks.retain_mut(|task| {
            task.remaining -= dt;
            if task.remaining > 0.0 {
                return true;
            }
            due.push((task.id, task.callback.clone()));
            if task.repeating {
                task.remaining = task.period;
                true
            } else {
                false
            }
        });
        due
    }

    /// Advance and run expired callbacks, each inside its own fault
    /// boundary: a failing callback is logged and the rest still run.
    pub fn update<E, F>(&mut self, dt: f64, run: F) -> usize
    where
        E: Display,
        F: FnMut(&C) -> Result<(), E>,
    {
        let due = self.advance(dt);
        Self::run_due(&due, run)
    }

    /// Run callbacks already taken out with `advance`, so callbacks that
    /// schedule new work never run while the scheduler is borrowed.
    pub fn run_due<E, F>(due: &[(TimerId, C)], mut run: F) -> usize
    where
        E: Display,
        F: FnMut(&C) -> Result<(), E>,
    {
        for (id, callback) in due {
            if let Err(e) = run(callback) {
                warn!(timer_id = id, error = %e, "Timer callback failed");
            }
        }
        due.len()
    }

    fn push(&mut self, seconds: f64, callback: C, repeating: bool) -> TimerId {
        self.next_id += 1;
        let period = if seconds.is_finite() { seconds.max(0.0) } else { 0.0 };
        self.tasks.push(Task {
            id: self.next_id,
            remaining: period,
            period,
            callback,
            repeating,
        });
        self.next_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f64 = 0.25;

    #[test]
    fn one_shot_fires_once_and_is_removed() {
        let mut scheduler = Scheduler::new();
        scheduler.wait(0.5, "boom");
        assert!(scheduler.advance(DT).is_empty());
        let due = scheduler.advance(DT);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].1, "boom");
        assert!(scheduler.is_empty());
        assert!(scheduler.advance(DT).is_empty());
    }

    #[test]
    fn repeating_task_rearms_to_its_period() {
        let mut scheduler = Scheduler::new();
        scheduler.every(0.5, 1u8);
        let fired: usize = (0..8).map(|_| scheduler.advance(DT).len()).sum();
        assert_eq!(fired, 4);
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn failing_callback_does_not_stop_the_rest() {
        let mut scheduler = Scheduler::new();
        scheduler.wait(0.1, 1);
        scheduler.wait(0.1, 2);
        scheduler.wait(0.1, 3);

        let mut ran = Vec::new();
        let fired = scheduler.update(DT, |n: &i32| {
            ran.push(*n);
            if *n == 2 {
                Err("exploded")
            } else {
                Ok(())
            }
        });

        assert_eq!(fired, 3);
        assert_eq!(ran, vec![1, 2, 3]);
    }

    #[test]
    fn cancelled_tasks_never_fire() {
        let mut scheduler = Scheduler::new();
        let a = scheduler.every(1.0, ());
        scheduler.wait(1.0, ());
        assert!(scheduler.cancel(a));
        assert!(!scheduler.cancel(a));
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.advance(1.0).len(), 1);
        assert!(scheduler.advance(5.0).is_empty());
    }
}
