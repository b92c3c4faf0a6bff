//! Deterministic cooperative task scheduler
//!
//! Two primitives are kept apart on purpose: a one-shot task never runs
//! before its delay elapses, while a recurring task runs immediately and
//! then once per interval. The scheduler owns no clock; the caller passes
//! `now` and dispatches whatever [`Scheduler::run_due`] hands back.

use std::collections::{BTreeMap, HashMap};
use tracing::trace;

/// Handle for cancelling a scheduled task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

#[derive(Debug)]
struct Entry<T> {
    task: T,
    due: u64,
    sequence: u64,
    interval: Option<u64>,
}

/// Single-threaded timer queue over tasks of type `T`
#[derive(Debug)]
pub struct Scheduler<T> {
    queue: BTreeMap<(u64, u64), TaskId>,
    entries: HashMap<TaskId, Entry<T>>,
    next_id: u64,
    next_sequence: u64,
}

impl<T: Clone> Scheduler<T> {
    /// Empty scheduler
    pub fn new() -> Self {
        Self {
            queue: BTreeMap::new(),
            entries: HashMap::new(),
            next_id: 1,
            next_sequence: 0,
        }
    }

    /// Run `task` once, no earlier than `now + delay_ms`
    pub fn schedule_once(&mut self, now: u64, delay_ms: u64, task: T) -> TaskId {
        self.insert(now.saturating_add(delay_ms), None, task)
    }

    /// Run `task` at `now` and then every `interval_ms`. An interval of 0
    /// is treated as 1 ms.
    pub fn schedule_every(&mut self, now: u64, interval_ms: u64, task: T) -> TaskId {
        self.insert(now, Some(interval_ms.max(1)), task)
    }

    fn insert(&mut self, due: u64, interval: Option<u64>, task: T) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        let sequence = self.bump_sequence();
        self.queue.insert((due, sequence), id);
        self.entries.insert(
            id,
            Entry {
                task,
                due,
                sequence,
                interval,
            },
        );
        id
    }

    fn bump_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    /// Drop a pending task. Returns false if it already ran or never existed.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        match self.entries.remove(&id) {
            Some(entry) => {
                self.queue.remove(&(entry.due, entry.sequence));
                true
            }
            None => false,
        }
    }

    /// Whether the task is still pending
    pub fn is_scheduled(&self, id: TaskId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Pop every task due at or before `now`, ordered by due time then
    /// insertion. Recurring tasks run at most once per call and are re-armed
    /// at `due + interval`.
    pub fn run_due(&mut self, now: u64) -> Vec<T> {
        let mut due_tasks = Vec::new();
        let mut rearm = Vec::new();

        while let Some((&(due, sequence), &id)) = self.queue.iter().next() {
            if due > now {
                break;
            }
            self.queue.remove(&(due, sequence));

            let recurring = match self.entries.get(&id) {
                Some(entry) => entry.interval,
                None => continue,
            };
            match recurring {
                Some(interval) => {
                    if let Some(entry) = self.entries.get(&id) {
                        due_tasks.push(entry.task.clone());
                    }
                    rearm.push((id, due.saturating_add(interval)));
                }
                None => {
                    if let Some(entry) = self.entries.remove(&id) {
                        due_tasks.push(entry.task);
                    }
                }
            }
        }

        for (id, next_due) in rearm {
            let sequence = self.bump_sequence();
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.due = next_due;
                entry.sequence = sequence;
                self.queue.insert((next_due, sequence), id);
            }
        }

        if !due_tasks.is_empty() {
            trace!(count = due_tasks.len(), now, "Dispatching due tasks");
        }
        due_tasks
    }

    /// Due time of the earliest pending task
    pub fn next_due(&self) -> Option<u64> {
        self.queue.keys().next().map(|(due, _)| *due)
    }

    /// Number of pending tasks
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No pending tasks
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: Clone> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}
