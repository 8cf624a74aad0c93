//! Main-loop timer queue.
//!
//! Scene data may only be touched from the main loop. Work that must run
//! later (teardown after the export call has returned) is registered with a
//! delay; work produced on worker threads is posted through a
//! [`MainLoopHandle`] and picked up on the next [`MainLoop::advance`].
//!
//! The clock is virtual: time moves only when the loop is advanced.

use crate::scene::Scene;
use crossbeam_channel::{Receiver, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;
use tracing::{debug, error};

/// A one-shot task run on the main loop.
pub type Task = Box<dyn FnOnce(&mut Scene) + Send>;

struct Scheduled {
    due: Duration,
    seq: u64,
    label: String,
    task: Task,
}

/// Cloneable sender used by worker threads to marshal work back.
#[derive(Clone)]
pub struct MainLoopHandle {
    sender: Sender<(String, Task)>,
}

impl MainLoopHandle {
    /// Queue a task to run at the next advance. Returns false once the loop is gone.
    pub fn post<F>(&self, label: impl Into<String>, task: F) -> bool
    where
        F: FnOnce(&mut Scene) + Send + 'static,
    {
        self.sender.send((label.into(), Box::new(task))).is_ok()
    }
}

/// Timer queue with a virtual clock.
pub struct MainLoop {
    now: Duration,
    seq: u64,
    queue: Vec<Scheduled>,
    sender: Sender<(String, Task)>,
    receiver: Receiver<(String, Task)>,
}

impl Default for MainLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl MainLoop {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            now: Duration::ZERO,
            seq: 0,
            queue: Vec::new(),
            sender,
            receiver,
        }
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn handle(&self) -> MainLoopHandle {
        MainLoopHandle {
            sender: self.sender.clone(),
        }
    }

    /// Run `task` once, `delay` after the current time.
    pub fn register<F>(&mut self, delay: Duration, label: impl Into<String>, task: F)
    where
        F: FnOnce(&mut Scene) + Send + 'static,
    {
        self.push(delay, label.into(), Box::new(task));
    }

    fn push(&mut self, delay: Duration, label: String, task: Task) {
        self.seq += 1;
        debug!(label = %label, delay_ms = delay.as_millis() as u64, "Registered main-loop task");
        self.queue.push(Scheduled {
            due: self.now + delay,
            seq: self.seq,
            label,
            task,
        });
    }

    /// Number of tasks waiting, including marshalled ones not yet picked up.
    pub fn pending(&self) -> usize {
        self.queue.len() + self.receiver.len()
    }

    /// Labels of the queued timer tasks in run order.
    pub fn pending_labels(&self) -> Vec<String> {
        let mut queued: Vec<&Scheduled> = self.queue.iter().collect();
        queued.sort_by_key(|s| (s.due, s.seq));
        queued.into_iter().map(|s| s.label.clone()).collect()
    }

    fn drain_marshalled(&mut self) {
        while let Ok((label, task)) = self.receiver.try_recv() {
            self.push(Duration::ZERO, label, task);
        }
    }

    fn pop_due(&mut self, limit: Duration) -> Option<Scheduled> {
        let index = self
            .queue
            .iter()
            .enumerate()
            .filter(|(_, s)| s.due <= limit)
            .min_by_key(|(_, s)| (s.due, s.seq))
            .map(|(i, _)| i)?;
        Some(self.queue.swap_remove(index))
    }

    /// Move the clock forward by `dt`, running every task that falls due.
    ///
    /// Tasks run in due-time order, ties in registration order. A panicking
    /// task is logged and does not stop the others. Returns the number of
    /// tasks run.
    pub fn advance(&mut self, scene: &mut Scene, dt: Duration) -> usize {
        self.drain_marshalled();
        let target = self.now + dt;
        let mut ran = 0;

        while let Some(scheduled) = self.pop_due(target) {
            self.now = scheduled.due;
            debug!(label = %scheduled.label, "Running main-loop task");
            let task = scheduled.task;
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| task(scene))) {
                error!(
                    label = %scheduled.label,
                    message = %panic_message(&panic),
                    "Main-loop task panicked"
                );
            }
            ran += 1;
        }

        self.now = target;
        ran
    }

    /// Advance to each next deadline until nothing is queued.
    pub fn run_until_idle(&mut self, scene: &mut Scene) -> usize {
        let mut ran = 0;
        loop {
            self.drain_marshalled();
            let Some(next) = self.queue.iter().map(|s| s.due).min() else {
                break;
            };
            let dt = next.saturating_sub(self.now);
            ran += self.advance(scene, dt);
        }
        ran
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
