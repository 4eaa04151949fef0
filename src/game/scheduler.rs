//! Cancellable timers polled from the tick function

/// Cancellation token for a scheduled task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

#[derive(Debug, Clone)]
struct Task<K> {
    handle: TimerHandle,
    due_ms: u64,
    period_ms: Option<u64>,
    kind: K,
}

/// Owns every pending timer of its owner so they can all be dropped at once
#[derive(Debug)]
pub struct Scheduler<K> {
    next_id: u64,
    tasks: Vec<Task<K>>,
}

impl<K: Clone> Scheduler<K> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            tasks: Vec::new(),
        }
    }

    fn push(&mut self, kind: K, due_ms: u64, period_ms: Option<u64>) -> TimerHandle {
        self.next_id += 1;
        let handle = TimerHandle(self.next_id);
        self.tasks.push(Task {
            handle,
            due_ms,
            period_ms,
            kind,
        });
        handle
    }

    pub fn once(&mut self, kind: K, due_ms: u64) -> TimerHandle {
        self.push(kind, due_ms, None)
    }

    /// Fires first at `first_due_ms`, then every `period_ms` until cancelled
    pub fn repeating(&mut self, kind: K, first_due_ms: u64, period_ms: u64) -> TimerHandle {
        self.push(kind, first_due_ms, Some(period_ms.max(1)))
    }

    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        let before = self.tasks.len();
        self.tasks.retain(|t| t.handle != handle);
        self.tasks.len() != before
    }

    pub fn cancel_all(&mut self) -> usize {
        let count = self.tasks.len();
        self.tasks.clear();
        count
    }

    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Pop every firing due at or before `now_ms`, earliest first. A
    /// repeating task that fell behind fires once per missed period.
    pub fn poll(&mut self, now_ms: u64) -> Vec<(TimerHandle, K)> {
        let mut fired: Vec<(u64, TimerHandle, K)> = Vec::new();
        for task in &mut self.tasks {
            while task.due_ms <= now_ms {
                fired.push((task.due_ms, task.handle, task.kind.clone()));
                match task.period_ms {
                    Some(period) => task.due_ms += period,
                    None => {
                        task.due_ms = u64::MAX;
                        break;
                    }
                }
            }
        }
        self.tasks
            .retain(|t| t.period_ms.is_some() || t.due_ms != u64::MAX);
        fired.sort_by_key(|(due, handle, _)| (*due, handle.0));
        fired.into_iter().map(|(_, h, k)| (h, k)).collect()
    }
}

impl<K: Clone> Default for Scheduler<K> {
    fn default() -> Self {
        Self::new()
    }
}
