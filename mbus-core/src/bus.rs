//! 总线节点（MessageBus）
//!
//! 每个作用域（应用、项目、模块等）对应树中的一个节点。节点负责：
//! - 树拓扑：父节点弱引用、强持有子节点、顺序向量；
//! - 各主题的直接订阅者列表；
//! - 各主题的订阅者缓存（按广播方向沿子节点或父节点解析，拓扑变化时整树失效）；
//! - 按主题缓存的发布者门面。
//!
//! 顺序向量：根为空向量，子节点为父向量追加一个严格递增的兄弟序号，
//! 按字典序比较即为深度优先顺序，决定排空时各总线的先后。
//!
//! 完整性违规（释放后使用、带未投递消息释放、重复/重入释放）既返回 `Err`，
//! 也会上报给根配置中的 `ErrorSink`。
//!
use crate::config::BusConfig;
use crate::connection::{Connection, ConnectionHandle, ConnectionId, ConnectionInner};
use crate::error::{BusError, BusResult};
use crate::lifetime::Lifetime;
use crate::listener::ListenerShape;
use crate::message::{Envelope, Message};
use crate::publisher::{Publisher, PublisherInner};
use crate::pump::{self, Job, OrderKey};
use crate::snapshot::{BusSnapshot, TopicSubscription};
use crate::topic::{BroadcastDirection, Topic, TopicId};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

static NEXT_ROOT_ID: AtomicU64 = AtomicU64::new(1);

const ACTIVE: u8 = 0;
const DISPOSING: u8 = 1;
const DISPOSED: u8 = 2;

/// 整棵树共享的根状态
pub(crate) struct RootState {
    config: BusConfig,
    epoch: AtomicU64,
    topics: DashMap<Arc<str>, RegisteredTopic>,
    node: OnceLock<Weak<BusNode>>,
}

struct RegisteredTopic {
    id: TopicId,
    shape: TypeId,
    shape_name: &'static str,
    /// 擦除后的 `Topic<L>`
    topic: Arc<dyn Any + Send + Sync>,
}

impl RootState {
    /// 使整棵树的订阅者缓存失效
    fn invalidate(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        if let Some(root) = self.node.get().and_then(Weak::upgrade) {
            root.clear_caches();
        }
    }
}

struct SubscriberList {
    topic: Arc<str>,
    connections: Vec<Arc<ConnectionInner>>,
}

struct CachedSubscribers {
    epoch: u64,
    connections: Arc<[Arc<ConnectionInner>]>,
}

pub(crate) struct BusNode {
    owner: String,
    order: OrderKey,
    root: Arc<RootState>,
    parent: Weak<BusNode>,
    children: RwLock<Vec<Arc<BusNode>>>,
    next_child: AtomicU32,
    subscribers: DashMap<TopicId, SubscriberList>,
    cache: DashMap<TopicId, CachedSubscribers>,
    publishers: DashMap<TopicId, Arc<dyn Any + Send + Sync>>,
    connections: DashMap<ConnectionId, Weak<ConnectionInner>>,
    state: AtomicU8,
}

impl BusNode {
    fn new(owner: String, order: OrderKey, root: Arc<RootState>, parent: Weak<BusNode>) -> Self {
        Self {
            owner,
            order,
            root,
            parent,
            children: RwLock::new(Vec::new()),
            next_child: AtomicU32::new(0),
            subscribers: DashMap::new(),
            cache: DashMap::new(),
            publishers: DashMap::new(),
            connections: DashMap::new(),
            state: AtomicU8::new(ACTIVE),
        }
    }

    pub(crate) fn owner(&self) -> &str {
        &self.owner
    }

    pub(crate) fn order_key(&self) -> &OrderKey {
        &self.order
    }

    pub(crate) fn config(&self) -> &BusConfig {
        &self.root.config
    }

    fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) == ACTIVE
    }

    /// 上报完整性违规
    pub(crate) fn report(&self, error: &BusError) {
        self.root.config.error_sink().report(error);
    }

    pub(crate) fn ensure_active(&self) -> BusResult<()> {
        if self.is_active() {
            return Ok(());
        }
        let err = BusError::BusDisposed {
            owner: self.owner.clone(),
        };
        self.report(&err);
        Err(err)
    }

    pub(crate) fn invalidate_tree(&self) {
        self.root.invalidate();
    }

    fn clear_caches(&self) {
        self.cache.clear();
        let children = self.children.read().clone();
        for child in children {
            child.clear_caches();
        }
    }

    fn create_child(self: &Arc<Self>, owner: String) -> BusResult<Arc<BusNode>> {
        self.ensure_active()?;

        let index = self.next_child.fetch_add(1, Ordering::Relaxed);
        let child = Arc::new(BusNode::new(
            owner,
            self.order.child(index),
            self.root.clone(),
            Arc::downgrade(self),
        ));

        {
            let mut children = self.children.write();
            // 锁内复核：父节点进入释放流程后不得再挂载子节点
            if !self.is_active() {
                drop(children);
                let err = BusError::BusDisposed {
                    owner: self.owner.clone(),
                };
                self.report(&err);
                return Err(err);
            }
            children.push(child.clone());
        }
        self.root.invalidate();

        tracing::debug!(
            owner = %child.owner,
            parent = %self.owner,
            order = ?child.order.order(),
            "message bus created"
        );
        Ok(child)
    }

    fn connect(self: &Arc<Self>) -> BusResult<Arc<ConnectionInner>> {
        self.ensure_active()?;
        let connection = Arc::new(ConnectionInner::new(Arc::downgrade(self)));
        self.connections
            .insert(connection.id(), Arc::downgrade(&connection));

        tracing::debug!(owner = %self.owner, connection = %connection.id(), "connection created");
        Ok(connection)
    }

    pub(crate) fn add_subscriber(
        &self,
        topic: TopicId,
        topic_name: Arc<str>,
        connection: &Arc<ConnectionInner>,
    ) {
        self.subscribers
            .entry(topic)
            .or_insert_with(|| SubscriberList {
                topic: topic_name,
                connections: Vec::new(),
            })
            .connections
            .push(connection.clone());
    }

    pub(crate) fn remove_subscriber(&self, topic: TopicId, connection: &Arc<ConnectionInner>) {
        if let Some(mut list) = self.subscribers.get_mut(&topic) {
            list.connections.retain(|c| !Arc::ptr_eq(c, connection));
        }
        self.subscribers
            .remove_if(&topic, |_, list| list.connections.is_empty());
    }

    pub(crate) fn forget_connection(&self, id: ConnectionId) {
        self.connections.remove(&id);
    }

    /// 解析主题的订阅者：命中缓存直接返回，否则按广播方向计算并写入缓存
    pub(crate) fn resolve(
        &self,
        topic: TopicId,
        direction: BroadcastDirection,
    ) -> Arc<[Arc<ConnectionInner>]> {
        // 先读 epoch 再计算：期间发生的失效会使本次写入的条目自然过期
        let epoch = self.root.epoch.load(Ordering::Acquire);
        if let Some(cached) = self.cache.get(&topic) {
            if cached.epoch == epoch {
                return cached.connections.clone();
            }
        }

        let mut collected = Vec::new();
        self.collect(topic, direction, &mut collected);
        let connections: Arc<[Arc<ConnectionInner>]> = collected.into();

        if self.is_active() {
            self.cache.insert(
                topic,
                CachedSubscribers {
                    epoch,
                    connections: connections.clone(),
                },
            );
        }
        connections
    }

    fn collect(
        &self,
        topic: TopicId,
        direction: BroadcastDirection,
        out: &mut Vec<Arc<ConnectionInner>>,
    ) {
        if let Some(list) = self.subscribers.get(&topic) {
            out.extend(
                list.connections
                    .iter()
                    .filter(|c| !c.is_disposed())
                    .cloned(),
            );
        }

        match direction {
            BroadcastDirection::None => {}
            BroadcastDirection::ToChildren => {
                let children = self.children.read().clone();
                for child in children.iter().filter(|child| child.is_active()) {
                    child.collect(topic, direction, out);
                }
            }
            BroadcastDirection::ToParent => {
                if let Some(parent) = self.parent.upgrade() {
                    parent.collect(topic, direction, out);
                }
            }
        }
    }

    /// 发布：为每个订阅连接在其所属总线的当前线程队列中入队，然后排空
    pub(crate) fn publish(
        self: &Arc<Self>,
        envelope: Arc<dyn Envelope>,
        direction: BroadcastDirection,
    ) -> BusResult<()> {
        self.ensure_active()?;

        let subscribers = self.resolve(envelope.topic_id(), direction);
        tracing::trace!(
            owner = %self.owner,
            topic = envelope.topic_name(),
            method = envelope.method(),
            subscribers = subscribers.len(),
            nested = pump::is_draining(),
            "publish"
        );

        for connection in subscribers.iter() {
            let Some(bus) = connection.bus() else {
                continue;
            };
            if !bus.is_active() {
                continue;
            }
            pump::enqueue(
                bus.order_key(),
                Job {
                    connection: connection.clone(),
                    envelope: envelope.clone(),
                },
            );
        }

        pump::drain(&self.root.config)
    }

    fn publisher<L>(self: &Arc<Self>, topic: &Topic<L>) -> BusResult<Publisher<L>>
    where
        L: ?Sized + ListenerShape,
    {
        self.ensure_active()?;

        let erased = self
            .publishers
            .entry(topic.id())
            .or_insert_with(|| {
                Arc::new(PublisherInner::new(self, topic.clone()))
                    as Arc<dyn Any + Send + Sync>
            })
            .clone();

        erased
            .downcast::<PublisherInner<L>>()
            .map(Publisher::from_inner)
            .map_err(|_| BusError::ShapeMismatch {
                topic: topic.name().to_string(),
                expected: "publisher cached for this topic id",
                found: L::SHAPE,
            })
    }

    pub(crate) fn lookup_topic<L>(&self, name: &str) -> BusResult<Topic<L>>
    where
        L: ?Sized + ListenerShape,
    {
        let registered = self
            .root
            .topics
            .get(name)
            .ok_or_else(|| BusError::UnknownTopic {
                topic: name.to_string(),
            })?;

        registered
            .topic
            .downcast_ref::<Topic<L>>()
            .cloned()
            .ok_or_else(|| BusError::ShapeMismatch {
                topic: name.to_string(),
                expected: registered.shape_name,
                found: L::SHAPE,
            })
    }

    fn register_topic<L>(&self, topic: &Topic<L>) -> BusResult<()>
    where
        L: ?Sized + ListenerShape,
    {
        match self.root.topics.entry(topic.name_arc()) {
            Entry::Occupied(entry) => {
                let registered = entry.get();
                if registered.id == topic.id() {
                    Ok(())
                } else if registered.shape != TypeId::of::<L>() {
                    Err(BusError::ShapeMismatch {
                        topic: topic.name().to_string(),
                        expected: registered.shape_name,
                        found: L::SHAPE,
                    })
                } else {
                    Err(BusError::TopicNameTaken {
                        topic: topic.name().to_string(),
                    })
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(RegisteredTopic {
                    id: topic.id(),
                    shape: TypeId::of::<L>(),
                    shape_name: L::SHAPE,
                    topic: Arc::new(topic.clone()),
                });
                tracing::debug!(topic = topic.name(), shape = L::SHAPE, "topic registered");
                Ok(())
            }
        }
    }

    /// 释放：先深度优先释放子节点，再检查本线程队列、释放连接、从父节点摘除
    fn dispose(self: &Arc<Self>) -> BusResult<()> {
        if let Err(state) =
            self.state
                .compare_exchange(ACTIVE, DISPOSING, Ordering::AcqRel, Ordering::Acquire)
        {
            let err = if state == DISPOSING {
                BusError::DisposeInProgress {
                    owner: self.owner.clone(),
                }
            } else {
                BusError::AlreadyDisposed {
                    target: format!("message bus {}", self.owner),
                }
            };
            self.report(&err);
            return Err(err);
        }

        let mut first_error: Option<BusError> = None;

        let children = self.children.read().clone();
        for child in children {
            if let Err(err) = child.dispose() {
                first_error.get_or_insert(err);
            }
        }

        // 队列中仍有任务意味着消息将永远不会被投递
        let pending = pump::discard(&self.order);
        if pending > 0 {
            let err = BusError::PendingDeliveries {
                owner: self.owner.clone(),
                count: pending,
            };
            self.report(&err);
            first_error.get_or_insert(err);
        }

        let connections: Vec<Arc<ConnectionInner>> = self
            .connections
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        for connection in &connections {
            if connection.is_disposed() {
                continue;
            }
            // 只可能是与显式释放竞争得到的 AlreadyDisposed，dispose 内部已上报
            if let Err(err) = connection.dispose(false) {
                tracing::trace!(
                    owner = %self.owner,
                    connection = %connection.id(),
                    error = %err,
                    "connection disposed concurrently"
                );
            }
        }
        self.connections.clear();
        self.subscribers.clear();
        self.publishers.clear();
        self.cache.clear();

        if let Some(parent) = self.parent.upgrade() {
            parent
                .children
                .write()
                .retain(|child| !Arc::ptr_eq(child, self));
        }

        self.state.store(DISPOSED, Ordering::Release);
        self.root.invalidate();

        tracing::debug!(
            owner = %self.owner,
            order = ?self.order.order(),
            connections = connections.len(),
            "message bus disposed"
        );

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn snapshot(&self) -> BusSnapshot {
        let mut subscriptions: Vec<TopicSubscription> = self
            .subscribers
            .iter()
            .map(|entry| TopicSubscription {
                topic: entry.value().topic.to_string(),
                connections: entry.value().connections.len(),
            })
            .collect();
        subscriptions.sort_by(|a, b| a.topic.cmp(&b.topic));

        let children = self.children.read().clone();
        BusSnapshot {
            owner: self.owner.clone(),
            order: self.order.order().to_vec(),
            disposed: !self.is_active(),
            connections: self.connections.len(),
            queued: pump::queued(&self.order),
            subscriptions,
            children: children.iter().map(|child| child.snapshot()).collect(),
        }
    }
}

/// 总线句柄（可克隆，克隆共享同一节点）
#[derive(Clone)]
pub struct MessageBus {
    node: Arc<BusNode>,
}

impl MessageBus {
    /// 创建根总线；整棵树共享该配置
    pub fn root(owner: impl Into<String>, config: BusConfig) -> Self {
        let root = Arc::new(RootState {
            config,
            epoch: AtomicU64::new(0),
            topics: DashMap::new(),
            node: OnceLock::new(),
        });
        let order = OrderKey::root(NEXT_ROOT_ID.fetch_add(1, Ordering::Relaxed));
        let node = Arc::new(BusNode::new(owner.into(), order, root.clone(), Weak::new()));
        let _ = root.node.set(Arc::downgrade(&node));

        tracing::debug!(owner = %node.owner, "root message bus created");
        Self { node }
    }

    pub(crate) fn from_node(node: Arc<BusNode>) -> Self {
        Self { node }
    }

    /// 创建子总线
    pub fn create_child(&self, owner: impl Into<String>) -> BusResult<MessageBus> {
        self.node.create_child(owner.into()).map(Self::from_node)
    }

    /// 创建连接，`Connection` 析构时自动释放
    pub fn connect(&self) -> BusResult<Connection> {
        let inner = self.node.connect()?;
        Ok(Connection::new(ConnectionHandle::new(inner)))
    }

    /// 创建绑定到生命周期的连接：生命周期释放时连接随之释放
    pub fn connect_with(&self, lifetime: &Lifetime) -> BusResult<ConnectionHandle> {
        let connection = self.connect()?;
        let handle = connection.handle();
        let key = lifetime.register(move || drop(connection));

        // 显式释放的连接撤销其在生命周期中的登记
        let owner = lifetime.downgrade();
        handle.inner().set_on_dispose(move || {
            if let Some(lifetime) = owner.upgrade() {
                lifetime.unregister(key);
            }
        });

        if handle.is_disposed() {
            return Err(BusError::ConnectionDisposed {
                connection: handle.id(),
            });
        }
        Ok(handle)
    }

    /// 获取主题的发布者门面（按主题缓存）
    pub fn publisher<L>(&self, topic: &Topic<L>) -> BusResult<Publisher<L>>
    where
        L: ?Sized + ListenerShape,
    {
        self.node.publisher(topic)
    }

    /// 直接发布一条消息（等价于 `publisher(topic)?.invoke(payload)`）
    pub fn publish<L>(&self, topic: &Topic<L>, payload: L::Message) -> BusResult<()>
    where
        L: ?Sized + ListenerShape,
    {
        let message = Message::new(topic.clone(), payload);
        self.node.publish(Arc::new(message), topic.direction())
    }

    /// 在根总线登记主题，供按名称订阅使用
    pub fn register_topic<L>(&self, topic: &Topic<L>) -> BusResult<()>
    where
        L: ?Sized + ListenerShape,
    {
        self.node.register_topic(topic)
    }

    /// 按名称查找已登记的主题
    pub fn topic<L>(&self, name: &str) -> BusResult<Topic<L>>
    where
        L: ?Sized + ListenerShape,
    {
        self.node.lookup_topic(name)
    }

    /// 诊断：当前线程上是否还有该主题尚未投递给订阅者的消息
    pub fn has_undelivered<L>(&self, topic: &Topic<L>) -> bool
    where
        L: ?Sized + ListenerShape,
    {
        if !pump::is_draining() || !self.node.is_active() {
            return false;
        }
        let subscribers = self.node.resolve(topic.id(), topic.direction());
        pump::has_undelivered(topic.id(), &subscribers)
    }

    /// 从本总线发布该主题时可达的订阅连接数
    pub fn subscriber_count<L>(&self, topic: &Topic<L>) -> usize
    where
        L: ?Sized + ListenerShape,
    {
        if !self.node.is_active() {
            return 0;
        }
        self.node.resolve(topic.id(), topic.direction()).len()
    }

    /// 释放总线及其全部子总线与连接
    pub fn dispose(&self) -> BusResult<()> {
        self.node.dispose()
    }

    pub fn is_disposed(&self) -> bool {
        !self.node.is_active()
    }

    pub fn owner(&self) -> &str {
        &self.node.owner
    }

    /// 顺序向量
    pub fn order(&self) -> &[u32] {
        self.node.order.order()
    }

    pub fn parent(&self) -> Option<MessageBus> {
        self.node.parent.upgrade().map(Self::from_node)
    }

    pub fn children(&self) -> Vec<MessageBus> {
        self.node
            .children
            .read()
            .iter()
            .cloned()
            .map(Self::from_node)
            .collect()
    }

    pub fn config(&self) -> &BusConfig {
        self.node.config()
    }

    /// 诊断快照（可序列化）
    pub fn snapshot(&self) -> BusSnapshot {
        self.node.snapshot()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("owner", &self.node.owner)
            .field("order", &self.node.order.order())
            .field("disposed", &!self.node.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::CollectingErrorSink;
    use mbus_macros::listener;
    use parking_lot::Mutex;

    #[listener]
    trait Counter {
        fn hit(&self, n: u32);
    }

    #[derive(Default)]
    struct Hits(Mutex<Vec<u32>>);

    impl Counter for Hits {
        fn hit(&self, n: u32) {
            self.0.lock().push(n);
        }
    }

    fn root_with_sink() -> (MessageBus, Arc<CollectingErrorSink>) {
        let sink = Arc::new(CollectingErrorSink::new());
        let config = BusConfig::builder().error_sink(sink.clone()).build();
        (MessageBus::root("app", config), sink)
    }

    #[test]
    fn child_order_vectors_extend_parent() {
        let (root, _) = root_with_sink();
        let a = root.create_child("a").unwrap();
        let b = root.create_child("b").unwrap();
        let a0 = a.create_child("a0").unwrap();

        assert!(root.order().is_empty());
        assert_eq!(a.order(), &[0]);
        assert_eq!(b.order(), &[1]);
        assert_eq!(a0.order(), &[0, 0]);
        assert!(a.order() < b.order());
        assert!(root.order() < a.order());
        assert!(a0.order() < b.order());
    }

    #[test]
    fn sibling_index_is_not_reused_after_dispose() {
        let (root, _) = root_with_sink();
        let a = root.create_child("a").unwrap();
        a.dispose().unwrap();
        let b = root.create_child("b").unwrap();
        assert_eq!(b.order(), &[1]);
    }

    #[test]
    fn cache_is_invalidated_when_child_is_added() {
        let (root, _) = root_with_sink();
        let topic: Topic<dyn Counter> = Topic::new("counter");
        let first = root.create_child("first").unwrap();
        let c1 = first.connect().unwrap();
        c1.subscribe(&topic, Arc::new(Hits::default()) as Arc<dyn Counter>)
            .unwrap();
        assert_eq!(root.subscriber_count(&topic), 1);

        // 缓存已填充；新增子节点及其订阅后必须重新解析
        let second = root.create_child("second").unwrap();
        let c2 = second.connect().unwrap();
        c2.subscribe(&topic, Arc::new(Hits::default()) as Arc<dyn Counter>)
            .unwrap();
        assert_eq!(root.subscriber_count(&topic), 2);

        second.dispose().unwrap();
        assert_eq!(root.subscriber_count(&topic), 1);
    }

    #[test]
    fn publishers_are_memoized_per_bus_and_topic() {
        let (root, _) = root_with_sink();
        let child = root.create_child("child").unwrap();
        let topic: Topic<dyn Counter> = Topic::new("counter");

        let p1 = root.publisher(&topic).unwrap();
        let p2 = root.publisher(&topic).unwrap();
        let p3 = child.publisher(&topic).unwrap();

        assert!(p1.ptr_eq(&p2));
        assert!(!p1.ptr_eq(&p3));
    }

    #[test]
    fn operations_on_disposed_bus_are_reported() {
        let (root, sink) = root_with_sink();
        let child = root.create_child("child").unwrap();
        child.dispose().unwrap();

        assert!(matches!(
            child.create_child("late"),
            Err(BusError::BusDisposed { .. })
        ));
        assert!(matches!(child.connect(), Err(BusError::BusDisposed { .. })));
        assert!(matches!(
            child.dispose(),
            Err(BusError::AlreadyDisposed { .. })
        ));
        assert_eq!(sink.len(), 3);
        assert!(root.children().is_empty());
    }

    #[test]
    fn dispose_releases_remaining_connections_silently() {
        let (root, sink) = root_with_sink();
        let topic: Topic<dyn Counter> = Topic::new("counter");
        let early = root.connect().unwrap();
        let late = root.connect().unwrap();
        late.subscribe(&topic, Arc::new(Hits::default()) as Arc<dyn Counter>)
            .unwrap();

        early.dispose().unwrap();
        root.dispose().unwrap();

        assert!(late.is_disposed());
        assert!(sink.is_empty());
        assert_eq!(root.snapshot().connections, 0);
    }

    #[test]
    fn register_topic_rejects_conflicting_names() {
        #[listener]
        trait Other {
            fn other(&self);
        }

        let (root, _) = root_with_sink();
        let topic: Topic<dyn Counter> = Topic::new("shared");
        root.register_topic(&topic).unwrap();
        root.register_topic(&topic).unwrap();

        let same_shape: Topic<dyn Counter> = Topic::new("shared");
        assert!(matches!(
            root.register_topic(&same_shape),
            Err(BusError::TopicNameTaken { .. })
        ));

        let other_shape: Topic<dyn Other> = Topic::new("shared");
        assert!(matches!(
            root.register_topic(&other_shape),
            Err(BusError::ShapeMismatch {
                expected: "Counter",
                found: "Other",
                ..
            })
        ));

        let child = root.create_child("child").unwrap();
        assert_eq!(child.topic::<dyn Counter>("shared").unwrap(), topic);
        assert!(matches!(
            child.topic::<dyn Counter>("missing"),
            Err(BusError::UnknownTopic { .. })
        ));
    }
}
