//! 连接（Connection）
//!
//! 连接是绑定在某个总线节点上的订阅句柄，持有“主题 → 监听器列表”的注册集合，
//! 可以独立于总线释放。释放连接会：
//! - 从所属总线各主题的直接订阅者列表中移除自身；
//! - 丢弃当前线程队列中尚未弹出的、发往自身的任务（其余任务顺序不变）；
//! - 使整棵树的订阅者缓存失效。
//!
//! `Connection` 是拥有所有权的守卫，析构时自动释放；
//! `ConnectionHandle` 是可克隆的非拥有句柄。
//!
use crate::bus::{BusNode, MessageBus};
use crate::error::{BusError, BusResult, ListenerFailure};
use crate::listener::{ListenerResult, ListenerShape, MessageHandler};
use crate::message::Envelope;
use crate::pump;
use crate::topic::{Topic, TopicId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// 连接标识（日志与诊断用）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone)]
enum Registration {
    /// 以 `Arc<L>` 擦除保存的类型化监听器
    Listener(Arc<dyn Any + Send + Sync>),
    /// 交给连接的默认处理器
    Default,
}

struct TopicRegistrations {
    topic: Arc<str>,
    entries: Vec<Registration>,
}

pub(crate) struct ConnectionInner {
    id: ConnectionId,
    bus: Weak<BusNode>,
    registrations: Mutex<HashMap<TopicId, TopicRegistrations>>,
    default_handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    on_dispose: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    disposed: AtomicBool,
}

impl ConnectionInner {
    pub(crate) fn new(bus: Weak<BusNode>) -> Self {
        Self {
            id: ConnectionId::next(),
            bus,
            registrations: Mutex::new(HashMap::new()),
            default_handler: RwLock::new(None),
            on_dispose: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    /// 设置释放回调；连接已释放时立即执行
    pub(crate) fn set_on_dispose(&self, hook: impl FnOnce() + Send + 'static) {
        {
            let mut slot = self.on_dispose.lock();
            if !self.is_disposed() {
                *slot = Some(Box::new(hook));
                return;
            }
        }
        hook();
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn bus(&self) -> Option<Arc<BusNode>> {
        self.bus.upgrade()
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// 把消息交给本连接在该主题上注册的全部监听器（按注册顺序）
    ///
    /// 单个监听器失败不影响其余监听器，失败追加到 `failures`。
    pub(crate) fn deliver(
        &self,
        envelope: &dyn Envelope,
        catch_panics: bool,
        failures: &mut Vec<ListenerFailure>,
    ) {
        if self.is_disposed() {
            return;
        }

        let entries = match self.registrations.lock().get(&envelope.topic_id()) {
            Some(registered) => registered.entries.clone(),
            None => return,
        };

        tracing::trace!(
            connection = %self.id,
            topic = envelope.topic_name(),
            method = envelope.method(),
            listeners = entries.len(),
            "deliver"
        );

        for entry in entries {
            let result = match &entry {
                Registration::Listener(listener) => {
                    invoke(catch_panics, || envelope.deliver_to(listener.as_ref()))
                }
                Registration::Default => {
                    let handler = self.default_handler.read().clone();
                    match handler {
                        Some(handler) => invoke(catch_panics, || handler.handle(envelope.as_raw())),
                        None => Ok(()),
                    }
                }
            };

            if let Err(cause) = result {
                tracing::debug!(
                    connection = %self.id,
                    topic = envelope.topic_name(),
                    method = envelope.method(),
                    error = %cause,
                    "listener failed"
                );
                failures.push(ListenerFailure {
                    topic: envelope.topic_name().to_string(),
                    method: envelope.method(),
                    connection: self.id,
                    cause,
                });
            }
        }
    }

    /// 标记释放并摘除注册；`drop_queued` 为真时同时丢弃当前线程队列中发往本连接的任务
    pub(crate) fn dispose(self: &Arc<Self>, drop_queued: bool) -> BusResult<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            let err = BusError::AlreadyDisposed {
                target: format!("connection {}", self.id),
            };
            if let Some(bus) = self.bus() {
                bus.report(&err);
            }
            return Err(err);
        }

        let topics: Vec<TopicId> = self.registrations.lock().drain().map(|(id, _)| id).collect();
        *self.default_handler.write() = None;

        if let Some(bus) = self.bus() {
            for topic in &topics {
                bus.remove_subscriber(*topic, self);
            }
            bus.forget_connection(self.id);

            let dropped = if drop_queued {
                pump::remove_connection_jobs(bus.order_key(), self)
            } else {
                0
            };
            bus.invalidate_tree();

            tracing::debug!(
                connection = %self.id,
                owner = bus.owner(),
                topics = topics.len(),
                dropped,
                "connection disposed"
            );
        }

        let hook = self.on_dispose.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        Ok(())
    }
}

fn invoke(catch_panics: bool, call: impl FnOnce() -> ListenerResult) -> ListenerResult {
    if !catch_panics {
        return call();
    }

    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result,
        Err(payload) => Err(anyhow::anyhow!(
            "listener panicked: {}",
            panic_message(payload.as_ref())
        )),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

/// 可克隆的连接句柄（不拥有连接的生命周期）
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<ConnectionInner>,
}

impl ConnectionHandle {
    pub(crate) fn new(inner: Arc<ConnectionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<ConnectionInner> {
        &self.inner
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// 所属总线（总线已被整体回收时返回 `None`）
    pub fn bus(&self) -> Option<MessageBus> {
        self.inner.bus().map(MessageBus::from_node)
    }

    /// 订阅主题：追加监听器，并在首次订阅该主题时把连接挂到总线的直接订阅者列表
    pub fn subscribe<L>(&self, topic: &Topic<L>, listener: Arc<L>) -> BusResult<()>
    where
        L: ?Sized + ListenerShape,
    {
        let listener: Arc<dyn Any + Send + Sync> = Arc::new(listener);
        self.register(topic.id(), topic.name_arc(), Registration::Listener(listener))?;

        tracing::debug!(
            connection = %self.inner.id,
            topic = topic.name(),
            shape = L::SHAPE,
            "subscribed"
        );
        Ok(())
    }

    /// 按名称订阅已登记的主题；监听器形态与登记的不一致时拒绝
    pub fn subscribe_named<L>(&self, name: &str, listener: Arc<L>) -> BusResult<Topic<L>>
    where
        L: ?Sized + ListenerShape,
    {
        let bus = self.live_bus()?;
        let topic = bus.lookup_topic::<L>(name)?;
        self.subscribe(&topic, listener)?;
        Ok(topic)
    }

    /// 设置默认处理器（替换已有的）
    pub fn set_default_handler<H>(&self, handler: H) -> BusResult<()>
    where
        H: MessageHandler + 'static,
    {
        self.live_bus()?;
        *self.inner.default_handler.write() = Some(Arc::new(handler));
        Ok(())
    }

    /// 以默认处理器订阅主题
    pub fn subscribe_default<L>(&self, topic: &Topic<L>) -> BusResult<()>
    where
        L: ?Sized + ListenerShape,
    {
        if self.inner.default_handler.read().is_none() {
            return Err(BusError::NoDefaultHandler {
                connection: self.inner.id,
            });
        }
        self.register(topic.id(), topic.name_arc(), Registration::Default)?;

        tracing::debug!(
            connection = %self.inner.id,
            topic = topic.name(),
            "subscribed with default handler"
        );
        Ok(())
    }

    /// 立即投递当前线程上排队给本连接的全部任务（按入队顺序），其他任务保持不动
    pub fn deliver_immediately(&self) -> BusResult<()> {
        let bus = self.live_bus()?;
        let jobs = pump::take_connection_jobs(bus.order_key(), &self.inner);
        let catch_panics = bus.config().catch_listener_panics();

        let mut failures = Vec::new();
        for job in jobs {
            job.connection
                .deliver(job.envelope.as_ref(), catch_panics, &mut failures);
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BusError::ListenerFailures(failures))
        }
    }

    /// 释放连接
    pub fn dispose(&self) -> BusResult<()> {
        self.inner.dispose(true)
    }

    fn live_bus(&self) -> BusResult<Arc<BusNode>> {
        if self.inner.is_disposed() {
            let err = BusError::ConnectionDisposed {
                connection: self.inner.id,
            };
            if let Some(bus) = self.inner.bus() {
                bus.report(&err);
            }
            return Err(err);
        }

        let bus = self.inner.bus().ok_or(BusError::ConnectionDisposed {
            connection: self.inner.id,
        })?;
        bus.ensure_active()?;
        Ok(bus)
    }

    fn register(
        &self,
        topic: TopicId,
        topic_name: Arc<str>,
        registration: Registration,
    ) -> BusResult<()> {
        let bus = self.live_bus()?;

        let first = {
            let mut registrations = self.inner.registrations.lock();
            let registered = registrations
                .entry(topic)
                .or_insert_with(|| TopicRegistrations {
                    topic: topic_name.clone(),
                    entries: Vec::new(),
                });
            registered.entries.push(registration);
            registered.entries.len() == 1
        };

        if first {
            bus.add_subscriber(topic, topic_name, &self.inner);
        }
        bus.invalidate_tree();

        // 与并发释放竞争时，释放方可能已经摘除过订阅
        if self.inner.is_disposed() {
            bus.remove_subscriber(topic, &self.inner);
            return Err(BusError::ConnectionDisposed {
                connection: self.inner.id,
            });
        }
        Ok(())
    }

    /// 本连接已订阅的主题名称
    pub fn topics(&self) -> Vec<String> {
        self.inner
            .registrations
            .lock()
            .values()
            .map(|registered| registered.topic.to_string())
            .collect()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("disposed", &self.inner.is_disposed())
            .finish()
    }
}

/// 拥有所有权的连接：析构时自动释放
pub struct Connection {
    handle: ConnectionHandle,
}

impl Connection {
    pub(crate) fn new(handle: ConnectionHandle) -> Self {
        Self { handle }
    }

    /// 获取非拥有句柄
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }
}

impl Deref for Connection {
    type Target = ConnectionHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Connection").field(&self.handle).finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.handle.is_disposed() {
            let _ = self.handle.dispose();
        }
    }
}
