//! 投递队列与泵（Delivery Queue & Pump）
//!
//! 每个调用线程为其触达的每条总线惰性维护一个 FIFO 队列，
//! 全部队列按所属总线的顺序向量排列（即线程内的“待处理总线集合”）。
//! 队列只属于当前线程，排空过程无需加锁。
//!
//! 排空规则：
//! - 同一线程只有最外层 publish 负责排空，嵌套 publish 只入队后立即返回；
//! - 每一轮按顺序向量升序逐条总线取出投递，直到该队列在弹出时为空；
//! - 投递可能向任意总线（包括本轮已处理过的）追加任务，因此每轮结束后重新扫描，
//!   直到所有队列为空。
//!
use crate::config::BusConfig;
use crate::connection::ConnectionInner;
use crate::error::{BusError, BusResult, ListenerFailure};
use crate::message::Envelope;
use crate::topic::TopicId;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// 总线在排空顺序中的位置：根 id + 顺序向量
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct OrderKey {
    root: u64,
    order: Arc<[u32]>,
}

impl OrderKey {
    pub(crate) fn root(root: u64) -> Self {
        Self {
            root,
            order: Arc::from(Vec::new()),
        }
    }

    /// 子节点的顺序向量：父向量追加一个兄弟序号
    pub(crate) fn child(&self, index: u32) -> Self {
        let mut order = self.order.to_vec();
        order.push(index);
        Self {
            root: self.root,
            order: order.into(),
        }
    }

    pub(crate) fn order(&self) -> &[u32] {
        &self.order
    }
}

/// 一次投递任务
pub(crate) struct Job {
    pub(crate) connection: Arc<ConnectionInner>,
    pub(crate) envelope: Arc<dyn Envelope>,
}

#[derive(Default)]
struct PumpState {
    queues: BTreeMap<OrderKey, VecDeque<Job>>,
}

thread_local! {
    static PUMP: RefCell<PumpState> = RefCell::new(PumpState::default());
    static DRAINING: Cell<bool> = const { Cell::new(false) };
}

/// 在当前线程上把任务追加到目标总线的队列，并将其标记为待处理
pub(crate) fn enqueue(bus: &OrderKey, job: Job) {
    PUMP.with_borrow_mut(|state| {
        state
            .queues
            .entry(bus.clone())
            .or_default()
            .push_back(job);
    });
}

fn pop(bus: &OrderKey) -> Option<Job> {
    PUMP.with_borrow_mut(|state| {
        let queue = state.queues.get_mut(bus)?;
        let job = queue.pop_front();
        if queue.is_empty() {
            state.queues.remove(bus);
        }
        job
    })
}

fn pending_buses() -> Vec<OrderKey> {
    PUMP.with_borrow(|state| state.queues.keys().cloned().collect())
}

struct DrainGuard;

impl DrainGuard {
    fn enter() -> Option<Self> {
        DRAINING.with(|draining| {
            if draining.replace(true) {
                None
            } else {
                Some(DrainGuard)
            }
        })
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            discard_all();
        }
        DRAINING.with(|draining| draining.set(false));
    }
}

/// 监听器 panic 穿出排空时丢弃本线程剩余的全部任务，避免被下一次无关的发布投递
fn discard_all() {
    let leftover = PUMP
        .try_with(|state| {
            state
                .try_borrow_mut()
                .map(|mut state| std::mem::take(&mut state.queues))
                .unwrap_or_default()
        })
        .unwrap_or_default();

    let count: usize = leftover.values().map(VecDeque::len).sum();
    if count > 0 {
        tracing::warn!(
            discarded = count,
            buses = leftover.len(),
            "listener panicked during drain, undelivered messages discarded"
        );
    }
}

/// 当前线程是否处于排空过程中
pub(crate) fn is_draining() -> bool {
    DRAINING.with(Cell::get)
}

/// 排空当前线程的全部队列（包括排空过程中新追加的任务）
///
/// 嵌套调用直接返回 `Ok(())`，由最外层调用负责投递并汇总监听器失败。
pub(crate) fn drain(config: &BusConfig) -> BusResult<()> {
    let Some(_guard) = DrainGuard::enter() else {
        return Ok(());
    };

    let mut failures: Vec<ListenerFailure> = Vec::new();
    let mut delivered = 0usize;
    let mut warned = false;

    loop {
        let pending = pending_buses();
        if pending.is_empty() {
            break;
        }

        for bus in &pending {
            while let Some(job) = pop(bus) {
                job.connection.deliver(
                    job.envelope.as_ref(),
                    config.catch_listener_panics(),
                    &mut failures,
                );
                delivered += 1;

                if !warned && delivered > config.drain_warn_threshold() {
                    warned = true;
                    tracing::warn!(
                        delivered,
                        threshold = config.drain_warn_threshold(),
                        "message drain exceeded threshold, a listener may be publishing in a loop"
                    );
                }
            }
        }
    }

    tracing::trace!(delivered, failures = failures.len(), "message drain finished");

    if failures.is_empty() {
        Ok(())
    } else {
        Err(BusError::ListenerFailures(failures))
    }
}

/// 丢弃当前线程上该总线的整个队列，返回被丢弃的任务数
pub(crate) fn discard(bus: &OrderKey) -> usize {
    PUMP.with_borrow_mut(|state| state.queues.remove(bus).map_or(0, |queue| queue.len()))
}

/// 移除当前线程队列中属于该连接的任务，其余任务保持原有顺序
pub(crate) fn remove_connection_jobs(bus: &OrderKey, connection: &Arc<ConnectionInner>) -> usize {
    take_connection_jobs(bus, connection).len()
}

/// 取出当前线程队列中属于该连接的任务（按入队顺序），其余任务保持原有顺序
pub(crate) fn take_connection_jobs(bus: &OrderKey, connection: &Arc<ConnectionInner>) -> Vec<Job> {
    PUMP.with_borrow_mut(|state| {
        let Some(queue) = state.queues.get_mut(bus) else {
            return Vec::new();
        };

        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(queue.len());
        for job in queue.drain(..) {
            if Arc::ptr_eq(&job.connection, connection) {
                taken.push(job);
            } else {
                kept.push_back(job);
            }
        }

        if kept.is_empty() {
            state.queues.remove(bus);
        } else {
            *queue = kept;
        }
        taken
    })
}

/// 当前线程上该总线队列中的任务数
pub(crate) fn queued(bus: &OrderKey) -> usize {
    PUMP.with_borrow(|state| state.queues.get(bus).map_or(0, VecDeque::len))
}

/// 当前线程上是否存在发往这些连接、属于该主题的未投递任务
pub(crate) fn has_undelivered(topic: TopicId, subscribers: &[Arc<ConnectionInner>]) -> bool {
    PUMP.with_borrow(|state| {
        state.queues.values().flatten().any(|job| {
            job.envelope.topic_id() == topic
                && subscribers
                    .iter()
                    .any(|subscriber| Arc::ptr_eq(subscriber, &job.connection))
        })
    })
}
