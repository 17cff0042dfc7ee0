use crate::errors::{AppError, AppResult};
use std::collections::VecDeque;
use std::time::Instant;

pub(crate) type TaskAction<R> = Box<dyn FnOnce(&mut R) + Send + 'static>;

pub(crate) struct QueuedTask<R> {
    pub seq: u64,
    pub enqueued_at: Instant,
    pub action: TaskAction<R>,
}

/// FIFO of deferred actions. The result sender captured by each action is its
/// completion signal: sent on success, dropped if the action faults.
pub(crate) struct RequestQueue<R> {
    tasks: VecDeque<QueuedTask<R>>,
    capacity: Option<usize>,
    next_seq: u64,
}

impl<R> RequestQueue<R> {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            tasks: VecDeque::new(),
            capacity,
            next_seq: 0,
        }
    }

    pub fn push(&mut self, action: TaskAction<R>) -> AppResult<u64> {
        if let Some(max) = self.capacity {
            if self.tasks.len() >= max {
                return Err(AppError::Policy(format!("Queue capacity exceeded (max {}).", max)));
            }
        }
        self.next_seq += 1;
        self.tasks.push_back(QueuedTask {
            seq: self.next_seq,
            enqueued_at: Instant::now(),
            action,
        });
        Ok(self.next_seq)
    }

    pub fn pop(&mut self) -> Option<QueuedTask<R>> {
        self.tasks.pop_front()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
