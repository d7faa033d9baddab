//! Foreground task runner feeding a host thread.
//!
//! Tasks are kept per priority, each priority with its own FIFO queue and a
//! min-heap of delayed tasks ordered by absolute deadline. Any thread may post;
//! only the owning host thread pops.

use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

// Thirty years; effectively never.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// Scheduling priority, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskPriority {
    UserBlocking,
    UserVisible,
    BestEffort,
}

impl TaskPriority {
    const COUNT: usize = 3;

    fn index(self) -> usize {
        match self {
            TaskPriority::UserBlocking => 0,
            TaskPriority::UserVisible => 1,
            TaskPriority::BestEffort => 2,
        }
    }
}

/// Whether a task may run from inside another task (for example while a
/// running task drains nestable work).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nestability {
    Nestable,
    NonNestable,
}

struct Queued<T> {
    task: T,
    nestability: Nestability,
}

struct Delayed<T> {
    deadline: Instant,
    seq: u64,
    queued: Queued<T>,
}

// Reversed so `BinaryHeap` yields the earliest deadline first. Equal deadlines
// keep posting order.
impl<T> Ord for Delayed<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T> PartialOrd for Delayed<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Delayed<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<T> Eq for Delayed<T> {}

struct PriorityQueue<T> {
    tasks: VecDeque<Queued<T>>,
    delayed: BinaryHeap<Delayed<T>>,
}

impl<T> PriorityQueue<T> {
    fn new() -> Self {
        Self {
            tasks: VecDeque::new(),
            delayed: BinaryHeap::new(),
        }
    }

    fn flush_delayed(&mut self, now: Instant) {
        while let Some(top) = self.delayed.peek() {
            if top.deadline > now {
                break;
            }
            if let Some(expired) = self.delayed.pop() {
                self.tasks.push_back(expired.queued);
            }
        }
    }

    fn pop_nestable(&mut self) -> Option<T> {
        let index = self
            .tasks
            .iter()
            .position(|queued| queued.nestability == Nestability::Nestable)?;
        self.tasks.remove(index).map(|queued| queued.task)
    }
}

struct Storage<T> {
    queues: Vec<PriorityQueue<T>>,
    seq: u64,
    closed: bool,
}

impl<T> Storage<T> {
    fn flush_delayed(&mut self, now: Instant) {
        for queue in &mut self.queues {
            queue.flush_delayed(now);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.queues
            .iter()
            .filter_map(|queue| queue.delayed.peek().map(|delayed| delayed.deadline))
            .min()
    }
}

/// Multi-producer, single-consumer task storage for one host.
pub struct ForegroundRunner<T> {
    storage: Mutex<Storage<T>>,
    notify: Notify,
}

impl<T> Default for ForegroundRunner<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ForegroundRunner<T> {
    pub fn new() -> Self {
        Self {
            storage: Mutex::new(Storage {
                queues: (0..TaskPriority::COUNT).map(|_| PriorityQueue::new()).collect(),
                seq: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Queue a nestable task. Returns the task back if the runner is closed.
    pub fn post(&self, priority: TaskPriority, task: T) -> Result<(), T> {
        self.push(priority, task, Nestability::Nestable)
    }

    pub fn post_non_nestable(&self, priority: TaskPriority, task: T) -> Result<(), T> {
        self.push(priority, task, Nestability::NonNestable)
    }

    /// Queue a nestable task that becomes runnable after `delay`. Delays past
    /// the representable range are clamped to a deadline decades away.
    pub fn post_delayed(&self, priority: TaskPriority, delay: Duration, task: T) -> Result<(), T> {
        let now = Instant::now();
        let deadline = now
            .checked_add(delay)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        self.post_at(priority, deadline, task)
    }

    /// Queue a nestable task that becomes runnable once `deadline` has passed.
    pub fn post_at(&self, priority: TaskPriority, deadline: Instant, task: T) -> Result<(), T> {
        {
            let mut storage = self.storage.lock();
            if storage.closed {
                return Err(task);
            }
            storage.seq += 1;
            let seq = storage.seq;
            storage.queues[priority.index()].delayed.push(Delayed {
                deadline,
                seq,
                queued: Queued {
                    task,
                    nestability: Nestability::Nestable,
                },
            });
        }
        self.notify.notify_one();
        Ok(())
    }

    fn push(&self, priority: TaskPriority, task: T, nestability: Nestability) -> Result<(), T> {
        {
            let mut storage = self.storage.lock();
            if storage.closed {
                return Err(task);
            }
            storage.queues[priority.index()]
                .tasks
                .push_back(Queued { task, nestability });
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Pop the next runnable task, highest priority first, after moving every
    /// delayed task whose deadline is at or before `now` into its queue.
    pub fn pop(&self, now: Instant) -> Option<T> {
        let mut storage = self.storage.lock();
        storage.flush_delayed(now);
        storage
            .queues
            .iter_mut()
            .find_map(|queue| queue.tasks.pop_front())
            .map(|queued| queued.task)
    }

    /// Like [`pop`](Self::pop) but skips non-nestable tasks.
    pub fn pop_nestable(&self, now: Instant) -> Option<T> {
        let mut storage = self.storage.lock();
        storage.flush_delayed(now);
        storage.queues.iter_mut().find_map(PriorityQueue::pop_nestable)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.storage.lock().next_deadline()
    }

    /// Number of queued tasks, delayed ones included.
    pub fn len(&self) -> usize {
        let storage = self.storage.lock();
        storage
            .queues
            .iter()
            .map(|queue| queue.tasks.len() + queue.delayed.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.storage.lock().closed
    }

    /// Reject all future posts and hand back everything still queued. The
    /// caller drops the returned tasks outside of the storage lock.
    pub fn close(&self) -> Vec<T> {
        let abandoned = {
            let mut storage = self.storage.lock();
            storage.closed = true;
            let mut abandoned = Vec::new();
            for queue in &mut storage.queues {
                abandoned.extend(queue.tasks.drain(..).map(|queued| queued.task));
                abandoned.extend(queue.delayed.drain().map(|delayed| delayed.queued.task));
            }
            abandoned
        };
        self.notify.notify_one();
        abandoned
    }

    /// Wait for the next runnable task. Resolves to `None` once `stop` is
    /// cancelled or the runner is closed.
    pub async fn next(&self, stop: &CancellationToken) -> Option<T> {
        loop {
            if stop.is_cancelled() {
                return None;
            }

            let notified = self.notify.notified();
            let deadline = {
                let mut storage = self.storage.lock();
                if storage.closed {
                    return None;
                }
                storage.flush_delayed(Instant::now());
                if let Some(queued) = storage
                    .queues
                    .iter_mut()
                    .find_map(|queue| queue.tasks.pop_front())
                {
                    return Some(queued.task);
                }
                storage.next_deadline()
            };

            let wake_at = async {
                match deadline {
                    Some(deadline) => {
                        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
                    }
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = stop.cancelled() => return None,
                _ = notified => {}
                _ = wake_at => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_fifo_within_priority() {
        let runner = ForegroundRunner::new();
        for i in 0..5 {
            runner.post(TaskPriority::UserVisible, i).unwrap();
        }
        let now = Instant::now();
        let order: Vec<_> = std::iter::from_fn(|| runner.pop(now)).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_priority_order() {
        let runner = ForegroundRunner::new();
        runner.post(TaskPriority::BestEffort, "background").unwrap();
        runner.post(TaskPriority::UserVisible, "visible").unwrap();
        runner.post(TaskPriority::UserBlocking, "blocking").unwrap();

        let now = Instant::now();
        assert_eq!(runner.pop(now), Some("blocking"));
        assert_eq!(runner.pop(now), Some("visible"));
        assert_eq!(runner.pop(now), Some("background"));
        assert_eq!(runner.pop(now), None);
    }

    #[test]
    fn test_delayed_task_waits_for_deadline() {
        let runner = ForegroundRunner::new();
        let base = Instant::now();
        runner
            .post_at(TaskPriority::UserVisible, base + Duration::from_secs(10), "late")
            .unwrap();

        assert_eq!(runner.pop(base), None);
        assert_eq!(runner.next_deadline(), Some(base + Duration::from_secs(10)));
        assert_eq!(runner.pop(base + Duration::from_secs(10)), Some("late"));
        assert!(runner.is_empty());
    }

    #[test]
    fn test_expired_delayed_task_queues_behind_immediate() {
        let runner = ForegroundRunner::new();
        let base = Instant::now();
        runner.post_at(TaskPriority::UserVisible, base, "delayed").unwrap();
        runner.post(TaskPriority::UserVisible, "immediate").unwrap();

        assert_eq!(runner.pop(base), Some("immediate"));
        assert_eq!(runner.pop(base), Some("delayed"));
    }

    #[test]
    fn test_pop_nestable_skips_non_nestable() {
        let runner = ForegroundRunner::new();
        runner.post_non_nestable(TaskPriority::UserVisible, "outer").unwrap();
        runner.post(TaskPriority::UserVisible, "inner").unwrap();

        let now = Instant::now();
        assert_eq!(runner.pop_nestable(now), Some("inner"));
        assert_eq!(runner.pop_nestable(now), None);
        assert_eq!(runner.pop(now), Some("outer"));
    }

    #[test]
    fn test_close_rejects_and_returns_pending() {
        let runner = ForegroundRunner::new();
        runner.post(TaskPriority::UserVisible, 1).unwrap();
        runner
            .post_delayed(TaskPriority::BestEffort, Duration::from_secs(60), 2)
            .unwrap();

        let mut abandoned = runner.close();
        abandoned.sort();
        assert_eq!(abandoned, vec![1, 2]);
        assert!(runner.is_closed());
        assert_eq!(runner.post(TaskPriority::UserVisible, 3), Err(3));
        assert_eq!(runner.pop(Instant::now()), None);
    }

    #[test]
    fn test_post_delayed_clamps_unrepresentable_delay() {
        let runner = ForegroundRunner::new();
        let before = Instant::now();
        runner
            .post_delayed(TaskPriority::UserVisible, Duration::MAX, "never")
            .unwrap();

        assert_eq!(runner.pop(Instant::now()), None);
        let deadline = runner.next_deadline().unwrap();
        assert!(deadline >= before + Duration::from_secs(365 * 24 * 60 * 60));
        assert_eq!(runner.close(), vec!["never"]);
    }

    #[test]
    fn test_next_wakes_on_post_from_other_thread() {
        let runner = Arc::new(ForegroundRunner::new());
        let stop = CancellationToken::new();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();

        let poster = runner.clone();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            poster.post(TaskPriority::UserVisible, 42).unwrap();
        });

        let task = rt.block_on(runner.next(&stop));
        thread.join().unwrap();
        assert_eq!(task, Some(42));
    }

    #[test]
    fn test_next_waits_for_delayed_deadline() {
        let runner = ForegroundRunner::new();
        let stop = CancellationToken::new();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();

        let started = Instant::now();
        runner
            .post_delayed(TaskPriority::UserVisible, Duration::from_millis(30), "timer")
            .unwrap();
        assert_eq!(rt.block_on(runner.next(&stop)), Some("timer"));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_next_returns_none_when_stopped() {
        let runner: ForegroundRunner<u32> = ForegroundRunner::new();
        let stop = CancellationToken::new();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();

        let canceller = stop.clone();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });
        assert_eq!(rt.block_on(runner.next(&stop)), None);
        thread.join().unwrap();
    }

    proptest! {
        #[test]
        fn prop_delayed_tasks_pop_in_deadline_order(delays in prop::collection::vec(0u64..1_000, 1..64)) {
            let runner = ForegroundRunner::new();
            let base = Instant::now();
            for (index, delay) in delays.iter().enumerate() {
                runner
                    .post_at(TaskPriority::UserVisible, base + Duration::from_millis(*delay), index)
                    .unwrap();
            }

            let horizon = base + Duration::from_secs(5);
            let popped: Vec<usize> = std::iter::from_fn(|| runner.pop(horizon)).collect();

            let mut expected: Vec<usize> = (0..delays.len()).collect();
            expected.sort_by_key(|&index| (delays[index], index));
            prop_assert_eq!(popped, expected);
        }
    }
}
