//! 消息总线统一错误定义
//!
//! 按处理策略分为三类：
//! - 完整性违规：逻辑错误，经 `ErrorSink` 上报后立即返回；
//! - 拓扑错误：订阅时即拒绝（如监听器形态不匹配）；
//! - 监听器失败：可恢复，单次 publish 的整轮投递结束后批量返回。
//!
use crate::connection::ConnectionId;
use thiserror::Error;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BusError {
    // --- 完整性违规 ---
    #[error("message bus is disposed: owner={owner}")]
    BusDisposed { owner: String },
    #[error("connection is disposed: connection={connection}")]
    ConnectionDisposed { connection: ConnectionId },
    #[error("already disposed: {target}")]
    AlreadyDisposed { target: String },
    #[error("dispose already in progress: owner={owner}")]
    DisposeInProgress { owner: String },
    #[error("message bus disposed with undelivered messages: owner={owner}, count={count}")]
    PendingDeliveries { owner: String, count: usize },

    // --- 拓扑 ---
    #[error("listener shape mismatch: topic={topic}, expected={expected}, found={found}")]
    ShapeMismatch {
        topic: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("topic name already taken: topic={topic}")]
    TopicNameTaken { topic: String },
    #[error("unknown topic: topic={topic}")]
    UnknownTopic { topic: String },
    #[error("no default handler: connection={connection}")]
    NoDefaultHandler { connection: ConnectionId },

    // --- 监听器 ---
    #[error("{} listener(s) failed during delivery", .0.len())]
    ListenerFailures(Vec<ListenerFailure>),
}

impl BusError {
    /// 是否属于完整性违规（需要经 ErrorSink 上报的致命错误）
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            Self::BusDisposed { .. }
                | Self::ConnectionDisposed { .. }
                | Self::AlreadyDisposed { .. }
                | Self::DisposeInProgress { .. }
                | Self::PendingDeliveries { .. }
        )
    }

    /// 批量监听器失败；其他错误返回空切片
    pub fn listener_failures(&self) -> &[ListenerFailure] {
        match self {
            Self::ListenerFailures(failures) => failures,
            _ => &[],
        }
    }
}

/// 单个监听器在投递中返回的错误（或 panic）
#[derive(Debug, Error)]
#[error("listener failed: topic={topic}, method={method}, connection={connection}: {cause}")]
pub struct ListenerFailure {
    pub topic: String,
    pub method: &'static str,
    pub connection: ConnectionId,
    pub cause: anyhow::Error,
}

/// 统一 Result 类型别名
pub type BusResult<T> = Result<T, BusError>;
