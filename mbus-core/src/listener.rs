//! 监听器形态（ListenerShape）
//!
//! 把“方法调用”抽象为带标签的消息：每个监听器 trait 对应一个消息枚举，
//! 每个变体对应一个方法及其参数。`#[listener]` 宏为 `dyn Trait` 生成实现，
//! 投递时通过 `dispatch` 还原为类型化调用，不依赖运行时反射。
//!
use crate::message::RawMessage;

/// 监听器调用结果
pub type ListenerResult = anyhow::Result<()>;

/// 监听器形态：描述一个主题的监听器暴露哪些方法与参数
pub trait ListenerShape: Send + Sync + 'static {
    /// 消息枚举（方法标识 + 参数）
    type Message: std::fmt::Debug + Send + Sync + 'static;

    /// 形态名称，用于日志与拓扑错误
    const SHAPE: &'static str;

    /// 消息对应的方法标识
    fn method_of(message: &Self::Message) -> &'static str;

    /// 将消息还原为对监听器的类型化调用
    fn dispatch(listener: &Self, message: &Self::Message) -> ListenerResult;
}

/// 监听器方法返回值归一化：`()` 或 `Result<(), E>`
pub trait IntoListenerResult {
    fn into_listener_result(self) -> ListenerResult;
}

impl IntoListenerResult for () {
    fn into_listener_result(self) -> ListenerResult {
        Ok(())
    }
}

impl<E> IntoListenerResult for Result<(), E>
where
    E: Into<anyhow::Error>,
{
    fn into_listener_result(self) -> ListenerResult {
        self.map_err(Into::into)
    }
}

/// 连接级默认处理器：接收以 `subscribe_default` 订阅的主题的所有消息
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &dyn RawMessage) -> ListenerResult;
}

impl<F> MessageHandler for F
where
    F: Fn(&dyn RawMessage) -> ListenerResult + Send + Sync,
{
    fn handle(&self, message: &dyn RawMessage) -> ListenerResult {
        self(message)
    }
}
