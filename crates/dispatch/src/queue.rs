use std::collections::VecDeque;

use tokio::time::Instant;

use crate::task::Task;

/// Bounded FIFO of admitted tasks waiting for a worker.
///
/// Only the dispatch loop dequeues, always from the front.
#[derive(Debug)]
pub(crate) struct TaskQueue {
    tasks: VecDeque<Task>,
    max_depth: usize,
}

impl TaskQueue {
    pub fn new(max_depth: usize) -> Self {
        Self {
            tasks: VecDeque::with_capacity(max_depth),
            max_depth,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Appends without blocking; hands the task back if the queue is full.
    pub fn enqueue(&mut self, task: Task) -> Result<(), Task> {
        if self.tasks.len() >= self.max_depth {
            return Err(task);
        }
        self.tasks.push_back(task);
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<Task> {
        self.tasks.pop_front()
    }

    /// Removes every task whose deadline is at or before `now`, keeping the
    /// order of the rest.
    pub fn remove_expired(&mut self, now: Instant) -> Vec<Task> {
        self.remove_where(|t| t.is_expired(now))
    }

    /// Removes tasks whose callers dropped their handles.
    pub fn remove_abandoned(&mut self) -> Vec<Task> {
        self.remove_where(Task::is_abandoned)
    }

    pub fn drain(&mut self) -> Vec<Task> {
        self.tasks.drain(..).collect()
    }

    fn remove_where(&mut self, pred: impl Fn(&Task) -> bool) -> Vec<Task> {
        if !self.tasks.iter().any(&pred) {
            return Vec::new();
        }
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(self.tasks.len());
        for task in self.tasks.drain(..) {
            if pred(&task) {
                removed.push(task);
            } else {
                kept.push_back(task);
            }
        }
        self.tasks = kept;
        removed
    }
}
