//! 发布者门面（Publisher）
//!
//! 把普通的方法调用打包成消息并交给投递泵，而不是直接调用监听器。
//! 同一 (总线, 主题) 的门面由总线缓存，重复获取得到同一个实例。
//! `#[listener]` 生成的 `<Trait>Publisher` trait 为 `Publisher<dyn Trait>` 提供与监听器同名的方法。
//!
use crate::bus::BusNode;
use crate::error::{BusError, BusResult};
use crate::listener::ListenerShape;
use crate::message::Message;
use crate::sink::ErrorSink;
use crate::topic::Topic;
use std::fmt;
use std::sync::{Arc, Weak};

pub(crate) struct PublisherInner<L: ?Sized + ListenerShape> {
    bus: Weak<BusNode>,
    // 总线被回收后仍用于诊断
    owner: String,
    error_sink: Arc<dyn ErrorSink>,
    topic: Topic<L>,
}

impl<L: ?Sized + ListenerShape> PublisherInner<L> {
    pub(crate) fn new(bus: &Arc<BusNode>, topic: Topic<L>) -> Self {
        Self {
            bus: Arc::downgrade(bus),
            owner: bus.owner().to_string(),
            error_sink: bus.config().error_sink().clone(),
            topic,
        }
    }
}

/// 某个主题在某条总线上的发布者
pub struct Publisher<L: ?Sized + ListenerShape> {
    inner: Arc<PublisherInner<L>>,
}

impl<L: ?Sized + ListenerShape> Publisher<L> {
    pub(crate) fn from_inner(inner: Arc<PublisherInner<L>>) -> Self {
        Self { inner }
    }

    pub fn topic(&self) -> &Topic<L> {
        &self.inner.topic
    }

    /// 发布一条消息
    ///
    /// 调用返回时，当前线程上由此次发布（以及监听器在投递中再次发布）产生的全部任务已投递完毕；
    /// 若在监听器内部调用，则只入队，由最外层的发布负责投递。
    /// 监听器不向调用方返回值，失败在整轮投递后以 `ListenerFailures` 汇总返回。
    pub fn invoke(&self, payload: L::Message) -> BusResult<()> {
        let Some(bus) = self.inner.bus.upgrade() else {
            let err = BusError::BusDisposed {
                owner: self.inner.owner.clone(),
            };
            self.inner.error_sink.report(&err);
            return Err(err);
        };
        let message = Message::new(self.inner.topic.clone(), payload);
        bus.publish(Arc::new(message), self.inner.topic.direction())
    }

    /// 两个门面是否为同一实例
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<L: ?Sized + ListenerShape> Clone for Publisher<L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<L: ?Sized + ListenerShape> fmt::Debug for Publisher<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("owner", &self.inner.owner)
            .field("topic", &self.inner.topic)
            .finish()
    }
}
