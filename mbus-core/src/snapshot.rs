//! 诊断快照
//!
//! 以可序列化的结构描述一棵总线子树：拓扑、连接数、各主题订阅数，
//! 以及调用线程上各总线的排队任务数。
//!
use serde::{Deserialize, Serialize};

/// 单个主题在某条总线上的直接订阅情况
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSubscription {
    pub topic: String,
    /// 直接订阅该主题的连接数
    pub connections: usize,
}

/// 总线子树快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusSnapshot {
    pub owner: String,
    pub order: Vec<u32>,
    pub disposed: bool,
    pub connections: usize,
    /// 调用线程上该总线队列中的任务数
    pub queued: usize,
    pub subscriptions: Vec<TopicSubscription>,
    pub children: Vec<BusSnapshot>,
}

impl BusSnapshot {
    /// 深度优先查找指定 owner 的子树
    pub fn find(&self, owner: &str) -> Option<&BusSnapshot> {
        if self.owner == owner {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(owner))
    }

    /// 子树中的连接总数
    pub fn total_connections(&self) -> usize {
        self.connections
            + self
                .children
                .iter()
                .map(BusSnapshot::total_connections)
                .sum::<usize>()
    }
}
