//! 消息（Message）
//!
//! 一次发布调用产生一条不可变消息：主题 + 方法标识 + 参数（即 `L::Message` 变体）。
//! 同一条消息以 `Arc` 共享给所有订阅连接的投递任务。
//!
use crate::listener::{ListenerResult, ListenerShape};
use crate::topic::{Topic, TopicId};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// 类型擦除后的消息视图，供默认处理器与诊断使用
pub trait RawMessage: fmt::Debug + Send + Sync {
    fn topic_id(&self) -> TopicId;

    fn topic_name(&self) -> &str;

    /// 方法标识
    fn method(&self) -> &'static str;

    /// 参数载荷，可向下转型为具体的 `L::Message`
    fn payload(&self) -> &dyn Any;
}

/// 类型化消息
pub struct Message<L: ?Sized + ListenerShape> {
    topic: Topic<L>,
    payload: L::Message,
}

impl<L: ?Sized + ListenerShape> Message<L> {
    pub fn new(topic: Topic<L>, payload: L::Message) -> Self {
        Self { topic, payload }
    }

    pub fn topic(&self) -> &Topic<L> {
        &self.topic
    }

    pub fn payload(&self) -> &L::Message {
        &self.payload
    }

    pub fn method(&self) -> &'static str {
        L::method_of(&self.payload)
    }
}

impl<L: ?Sized + ListenerShape> fmt::Debug for Message<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("topic", &self.topic.name())
            .field("payload", &self.payload)
            .finish()
    }
}

impl<L: ?Sized + ListenerShape> RawMessage for Message<L> {
    fn topic_id(&self) -> TopicId {
        self.topic.id()
    }

    fn topic_name(&self) -> &str {
        self.topic.name()
    }

    fn method(&self) -> &'static str {
        L::method_of(&self.payload)
    }

    fn payload(&self) -> &dyn Any {
        &self.payload
    }
}

/// 投递队列中的消息：可把自身交给任意已注册的监听器
pub(crate) trait Envelope: RawMessage {
    fn deliver_to(&self, listener: &(dyn Any + Send + Sync)) -> ListenerResult;

    fn as_raw(&self) -> &dyn RawMessage;
}

impl<L: ?Sized + ListenerShape> Envelope for Message<L> {
    fn deliver_to(&self, listener: &(dyn Any + Send + Sync)) -> ListenerResult {
        // 注册时以 Arc<L> 擦除，键与主题 id 一一对应
        match listener.downcast_ref::<Arc<L>>() {
            Some(listener) => L::dispatch(listener.as_ref(), &self.payload),
            None => Err(anyhow::anyhow!(
                "listener registered on topic `{}` is not a `{}`",
                self.topic.name(),
                L::SHAPE
            )),
        }
    }

    fn as_raw(&self) -> &dyn RawMessage {
        self
    }
}
