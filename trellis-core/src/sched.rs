//! In-flight upstream schedulers.
//!
//! When enabled, the acquire-and-forward step of every request runs under
//! a dispatcher that bounds concurrent upstream work per shard to
//! `max_inflight` and picks who goes next:
//!
//! - *Priority*: ten levels, highest first; level 0 can be held back for
//!   `low_delay` to let late-arriving higher-priority work overtake
//! - *Fair*: one FIFO per flow key, round-robin across active flows
//! - *EDF*: earliest deadline first, FIFO within equal deadlines
//!
//! Admission is ticket-based: a queued task parks on a oneshot receiver
//! and the dispatcher wakes exactly one task per freed slot, so the
//! in-flight bound holds across await points without polling.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

/// Scheduler selection from `[priority] mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedMode {
    #[default]
    Off,
    Priority,
    Fair,
    Edf,
}

impl SchedMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(SchedMode::Off),
            "priority" => Some(SchedMode::Priority),
            "fair" => Some(SchedMode::Fair),
            "edf" => Some(SchedMode::Edf),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedConfig {
    pub mode: SchedMode,
    pub max_inflight: usize,
    /// Hold-back for priority level 0.
    pub low_delay: Duration,
    pub priority_header: String,
    pub priority_query: String,
    pub flow_header: String,
    pub flow_query: String,
    pub deadline_header: String,
    pub deadline_query: String,
    pub default_deadline: Duration,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            mode: SchedMode::Off,
            max_inflight: 64,
            low_delay: Duration::ZERO,
            priority_header: "X-Priority".to_string(),
            priority_query: "priority".to_string(),
            flow_header: "X-Flow".to_string(),
            flow_query: "flow".to_string(),
            deadline_header: "X-Deadline-Ms".to_string(),
            deadline_query: "deadline_ms".to_string(),
            default_deadline: Duration::from_millis(1000),
        }
    }
}

/// Scheduling attributes of one request.
#[derive(Debug, Clone)]
pub struct TaskMeta {
    /// 0 (background) ..= 9 (urgent).
    pub priority: u8,
    /// Flow key for fair scheduling; falls back to the client IP.
    pub flow: String,
    /// Relative deadline for EDF.
    pub deadline: Duration,
}

impl Default for TaskMeta {
    fn default() -> Self {
        Self {
            priority: 5,
            flow: String::new(),
            deadline: Duration::from_millis(1000),
        }
    }
}

const PRIORITY_LEVELS: usize = 10;

struct Waiting {
    ticket: oneshot::Sender<()>,
    enqueued: Instant,
}

struct EdfEntry {
    deadline: Instant,
    seq: u64,
    waiting: Waiting,
}

impl PartialEq for EdfEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for EdfEntry {}
impl PartialOrd for EdfEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for EdfEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

enum Queue {
    Priority(Vec<VecDeque<Waiting>>),
    Fair {
        flows: HashMap<String, VecDeque<Waiting>>,
        ring: VecDeque<String>,
    },
    Edf(BinaryHeap<Reverse<EdfEntry>>),
}

impl Queue {
    fn new(mode: SchedMode) -> Self {
        match mode {
            SchedMode::Priority | SchedMode::Off => {
                Queue::Priority((0..PRIORITY_LEVELS).map(|_| VecDeque::new()).collect())
            }
            SchedMode::Fair => Queue::Fair {
                flows: HashMap::new(),
                ring: VecDeque::new(),
            },
            SchedMode::Edf => Queue::Edf(BinaryHeap::new()),
        }
    }

    fn len(&self) -> usize {
        match self {
            Queue::Priority(levels) => levels.iter().map(VecDeque::len).sum(),
            Queue::Fair { flows, .. } => flows.values().map(VecDeque::len).sum(),
            Queue::Edf(heap) => heap.len(),
        }
    }
}

struct State {
    inflight: usize,
    queue: Queue,
    seq: u64,
}

/// One per shard; see [`DispatcherSet`].
pub struct Dispatcher {
    cfg: SchedConfig,
    state: Mutex<State>,
}

impl Dispatcher {
    pub fn new(cfg: SchedConfig) -> Arc<Self> {
        let queue = Queue::new(cfg.mode);
        Arc::new(Self {
            cfg,
            state: Mutex::new(State {
                inflight: 0,
                queue,
                seq: 0,
            }),
        })
    }

    /// Queue depth (diagnostics).
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn inflight(&self) -> usize {
        self.state.lock().inflight
    }

    /// Run `fut` under the scheduling policy. The future starts once a
    /// slot is granted and the slot is returned when it finishes,
    /// success or failure.
    pub async fn run<F>(self: &Arc<Self>, meta: TaskMeta, fut: F) -> F::Output
    where
        F: Future,
    {
        if self.cfg.mode == SchedMode::Off || self.cfg.max_inflight == 0 {
            return fut.await;
        }

        // The guard returns the slot on drop, which also covers the task
        // being cancelled mid-flight (client gone).
        let _slot = match self.admit_or_enqueue(meta) {
            None => Some(SlotGuard {
                dispatcher: Arc::clone(self),
            }),
            Some(rx) => {
                // The ticket wrapper releases a grant that landed while
                // we were being cancelled, so the slot cannot leak.
                let mut ticket = QueuedTicket {
                    rx: Some(rx),
                    dispatcher: Arc::clone(self),
                };
                let granted = match ticket.rx.as_mut() {
                    Some(rx) => rx.await.is_ok(),
                    None => false,
                };
                ticket.rx = None;
                granted.then(|| SlotGuard {
                    dispatcher: Arc::clone(self),
                })
            }
        };
        fut.await
    }

    /// None = admitted immediately; Some(rx) = parked.
    fn admit_or_enqueue(self: &Arc<Self>, meta: TaskMeta) -> Option<oneshot::Receiver<()>> {
        let mut st = self.state.lock();
        if st.inflight < self.cfg.max_inflight && st.queue.len() == 0 {
            // Level-0 work may still be held back even with free slots.
            let delay_gate =
                self.cfg.mode == SchedMode::Priority && meta.priority == 0 && !self.cfg.low_delay.is_zero();
            if !delay_gate {
                st.inflight += 1;
                return None;
            }
        }

        let (tx, rx) = oneshot::channel();
        let waiting = Waiting {
            ticket: tx,
            enqueued: Instant::now(),
        };
        st.seq += 1;
        let seq = st.seq;
        match &mut st.queue {
            Queue::Priority(levels) => {
                let level = usize::from(meta.priority.min(9));
                levels[level].push_back(waiting);
            }
            Queue::Fair { flows, ring } => {
                let flow = meta.flow;
                if !flows.contains_key(&flow) {
                    ring.push_back(flow.clone());
                }
                flows.entry(flow).or_default().push_back(waiting);
            }
            Queue::Edf(heap) => {
                heap.push(Reverse(EdfEntry {
                    deadline: Instant::now() + meta.deadline,
                    seq,
                    waiting,
                }));
            }
        }
        self.pump_locked(&mut st);
        Some(rx)
    }

    /// Completion hook: frees the slot and admits the next queued task.
    pub fn on_task_done(self: &Arc<Self>) {
        let mut st = self.state.lock();
        st.inflight = st.inflight.saturating_sub(1);
        self.pump_locked(&mut st);
    }

    fn pump_locked(self: &Arc<Self>, st: &mut State) {
        while st.inflight < self.cfg.max_inflight {
            match self.pop_next(&mut st.queue) {
                Pop::Granted(waiting) => {
                    st.inflight += 1;
                    if waiting.ticket.send(()).is_err() {
                        // Task is gone (client disconnected while queued).
                        st.inflight -= 1;
                        continue;
                    }
                    trace!(inflight = st.inflight, "dispatcher admitted task");
                }
                Pop::DelayUntil(when) => {
                    // Only held-back level-0 work remains; re-pump later.
                    let me = Arc::clone(self);
                    tokio::spawn(async move {
                        tokio::time::sleep_until(tokio::time::Instant::from_std(when)).await;
                        let mut st = me.state.lock();
                        me.pump_locked(&mut st);
                    });
                    break;
                }
                Pop::Empty => break,
            }
        }
    }

    fn pop_next(&self, queue: &mut Queue) -> Pop {
        match queue {
            Queue::Priority(levels) => {
                for level in (1..PRIORITY_LEVELS).rev() {
                    if let Some(w) = levels[level].pop_front() {
                        return Pop::Granted(w);
                    }
                }
                let hold_until = match levels[0].front() {
                    None => return Pop::Empty,
                    Some(_) if self.cfg.low_delay.is_zero() => None,
                    Some(w) => {
                        let ready_at = w.enqueued + self.cfg.low_delay;
                        (Instant::now() < ready_at).then_some(ready_at)
                    }
                };
                match hold_until {
                    None => levels[0].pop_front().map(Pop::Granted).unwrap_or(Pop::Empty),
                    Some(at) => Pop::DelayUntil(at),
                }
            }
            Queue::Fair { flows, ring } => {
                while let Some(flow) = ring.pop_front() {
                    if let Some(q) = flows.get_mut(&flow) {
                        if let Some(w) = q.pop_front() {
                            if q.is_empty() {
                                flows.remove(&flow);
                            } else {
                                ring.push_back(flow);
                            }
                            return Pop::Granted(w);
                        }
                        flows.remove(&flow);
                    }
                }
                Pop::Empty
            }
            Queue::Edf(heap) => match heap.pop() {
                Some(Reverse(entry)) => Pop::Granted(entry.waiting),
                None => Pop::Empty,
            },
        }
    }
}

enum Pop {
    Granted(Waiting),
    DelayUntil(Instant),
    Empty,
}

/// Returns the in-flight slot when dropped.
struct SlotGuard {
    dispatcher: Arc<Dispatcher>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.dispatcher.on_task_done();
    }
}

/// A parked task's ticket. Dropped mid-await, it checks whether a grant
/// raced in and hands the slot back.
struct QueuedTicket {
    rx: Option<oneshot::Receiver<()>>,
    dispatcher: Arc<Dispatcher>,
}

impl Drop for QueuedTicket {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            if rx.try_recv().is_ok() {
                self.dispatcher.on_task_done();
            }
        }
    }
}

/// Per-shard dispatchers; a connection uses the shard it was assigned at
/// accept time, which keeps queue contention bounded the way the per-loop
/// dispatchers of a reactor design would.
pub struct DispatcherSet {
    shards: Vec<Arc<Dispatcher>>,
}

impl DispatcherSet {
    pub fn new(cfg: &SchedConfig, shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Dispatcher::new(cfg.clone())).collect(),
        }
    }

    pub fn for_shard(&self, shard: usize) -> &Arc<Dispatcher> {
        &self.shards[shard % self.shards.len()]
    }

    pub fn total_queued(&self) -> usize {
        self.shards.iter().map(|d| d.queued()).sum()
    }

    pub fn total_inflight(&self) -> usize {
        self.shards.iter().map(|d| d.inflight()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn config(mode: SchedMode, max_inflight: usize) -> SchedConfig {
        SchedConfig {
            mode,
            max_inflight,
            ..Default::default()
        }
    }

    /// Occupy the only slot, queue tagged tasks, then release and collect
    /// completion order.
    async fn ordering_of(mode: SchedMode, metas: Vec<(TaskMeta, &'static str)>) -> Vec<&'static str> {
        let dispatcher = Dispatcher::new(config(mode, 1));
        let (hold_tx, hold_rx) = oneshot::channel::<()>();
        let blocker = {
            let d = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                d.run(TaskMeta::default(), async move {
                    let _ = hold_rx.await;
                })
                .await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let mut handles = Vec::new();
        for (meta, tag) in metas {
            let d = Arc::clone(&dispatcher);
            let done = done_tx.clone();
            handles.push(tokio::spawn(async move {
                d.run(meta, async move {
                    let _ = done.send(tag);
                })
                .await;
            }));
            // Deterministic enqueue order.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let _ = hold_tx.send(());
        let _ = blocker.await;
        for h in handles {
            let _ = h.await;
        }
        drop(done_tx);
        let mut order = Vec::new();
        while let Some(tag) = done_rx.recv().await {
            order.push(tag);
        }
        order
    }

    fn meta(priority: u8, flow: &str, deadline_ms: u64) -> TaskMeta {
        TaskMeta {
            priority,
            flow: flow.to_string(),
            deadline: Duration::from_millis(deadline_ms),
        }
    }

    #[tokio::test]
    async fn test_off_mode_runs_inline() {
        let dispatcher = Dispatcher::new(config(SchedMode::Off, 1));
        let value = dispatcher.run(TaskMeta::default(), async { 42 }).await;
        assert_eq!(value, 42);
        assert_eq!(dispatcher.inflight(), 0);
    }

    #[tokio::test]
    async fn test_priority_high_first() {
        let order = ordering_of(
            SchedMode::Priority,
            vec![
                (meta(2, "", 0), "low"),
                (meta(9, "", 0), "urgent"),
                (meta(5, "", 0), "mid"),
            ],
        )
        .await;
        assert_eq!(order, vec!["urgent", "mid", "low"]);
    }

    #[tokio::test]
    async fn test_fair_round_robins_flows() {
        let order = ordering_of(
            SchedMode::Fair,
            vec![
                (meta(5, "a", 0), "a1"),
                (meta(5, "a", 0), "a2"),
                (meta(5, "a", 0), "a3"),
                (meta(5, "b", 0), "b1"),
                (meta(5, "b", 0), "b2"),
            ],
        )
        .await;
        assert_eq!(order, vec!["a1", "b1", "a2", "b2", "a3"]);
    }

    #[tokio::test]
    async fn test_edf_earliest_deadline_first() {
        let order = ordering_of(
            SchedMode::Edf,
            vec![
                (meta(5, "", 5000), "late"),
                (meta(5, "", 50), "soon"),
                (meta(5, "", 500), "mid"),
            ],
        )
        .await;
        assert_eq!(order, vec!["soon", "mid", "late"]);
    }

    #[tokio::test]
    async fn test_max_inflight_bound() {
        let dispatcher = Dispatcher::new(config(SchedMode::Priority, 2));
        let (release_tx, _) = tokio::sync::broadcast::channel::<()>(1);
        let mut handles = Vec::new();
        for _ in 0..5 {
            let d = Arc::clone(&dispatcher);
            let mut release = release_tx.subscribe();
            handles.push(tokio::spawn(async move {
                d.run(TaskMeta::default(), async move {
                    let _ = release.recv().await;
                })
                .await;
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dispatcher.inflight(), 2);
        assert_eq!(dispatcher.queued(), 3);

        let _ = release_tx.send(());
        for h in handles {
            let _ = h.await;
        }
        assert_eq!(dispatcher.inflight(), 0);
        assert_eq!(dispatcher.queued(), 0);
    }

    #[tokio::test]
    async fn test_shard_selection_wraps() {
        let set = DispatcherSet::new(&config(SchedMode::Priority, 4), 3);
        assert!(Arc::ptr_eq(set.for_shard(0), set.for_shard(3)));
        assert!(!Arc::ptr_eq(set.for_shard(0), set.for_shard(1)));
    }
}
