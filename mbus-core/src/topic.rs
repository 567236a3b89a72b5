//! 主题（Topic）
//!
//! 主题标识一条消息通道：名称、监听器形态（类型参数 `L`）与广播方向。
//! 每次 `Topic::new` 都会分配进程内唯一的 id，同名的两个主题是不同的通道；
//! 克隆得到的主题共享同一 id。
//!
use crate::listener::ListenerShape;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TOPIC_ID: AtomicU64 = AtomicU64::new(1);

/// 主题的进程内唯一标识
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicId(u64);

impl TopicId {
    fn next() -> Self {
        Self(NEXT_TOPIC_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 广播方向
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BroadcastDirection {
    /// 仅投递给发布所在总线的订阅者
    None,
    /// 同时投递给所有后代总线的订阅者
    #[default]
    ToChildren,
    /// 同时投递给祖先总线的订阅者
    ToParent,
}

/// 类型化的消息通道
pub struct Topic<L: ?Sized> {
    id: TopicId,
    name: Arc<str>,
    direction: BroadcastDirection,
    _shape: PhantomData<fn(&L)>,
}

impl<L: ?Sized + ListenerShape> Topic<L> {
    /// 以默认方向（`ToChildren`）创建主题
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self::with_direction(name, BroadcastDirection::default())
    }

    pub fn with_direction(name: impl Into<Arc<str>>, direction: BroadcastDirection) -> Self {
        Self {
            id: TopicId::next(),
            name: name.into(),
            direction,
            _shape: PhantomData,
        }
    }

    /// 监听器形态名称
    pub fn shape(&self) -> &'static str {
        L::SHAPE
    }
}

impl<L: ?Sized> Topic<L> {
    pub fn id(&self) -> TopicId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> BroadcastDirection {
        self.direction
    }

    pub(crate) fn name_arc(&self) -> Arc<str> {
        self.name.clone()
    }
}

impl<L: ?Sized> Clone for Topic<L> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            direction: self.direction,
            _shape: PhantomData,
        }
    }
}

impl<L: ?Sized> PartialEq for Topic<L> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<L: ?Sized> Eq for Topic<L> {}

impl<L: ?Sized> fmt::Debug for Topic<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("direction", &self.direction)
            .finish()
    }
}

impl<L: ?Sized> fmt::Display for Topic<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
