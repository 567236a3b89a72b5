//! 分层消息总线核心库（mbus-core）
//!
//! 提供进程内、按作用域分层的发布/订阅总线：
//! - 总线树（`bus`）：每个作用域一个节点，顺序向量决定深度优先的投递顺序
//! - 主题（`topic`）与监听器形态（`listener`）：类型化的消息通道
//! - 连接（`connection`）：可独立释放的订阅句柄，支持默认处理器与立即投递
//! - 投递泵（`pump`）：线程内队列，保证同线程发布的消息按发布顺序、无递归地投递
//! - 发布者门面（`publisher`）：把方法调用打包为消息
//! - 生命周期（`lifetime`）：释放动作树，用于把连接绑定到作用域
//!
//! 典型用法：
//! 1. 用 `#[listener]` 声明监听器 trait，并定义 `Topic<dyn Trait>`；
//! 2. 以 `MessageBus::root` 创建根总线，按作用域 `create_child`；
//! 3. 在某条总线上 `connect` 并 `subscribe`；
//! 4. 通过 `publisher(&topic)` 得到的门面调用方法完成广播。
//!
pub mod bus;
pub mod config;
pub mod connection;
pub mod error;
pub mod lifetime;
pub mod listener;
pub mod message;
pub mod publisher;
mod pump;
pub mod sink;
pub mod snapshot;
pub mod topic;

pub use bus::MessageBus;
pub use config::BusConfig;
pub use connection::{Connection, ConnectionHandle, ConnectionId};
pub use error::{BusError, BusResult, ListenerFailure};
pub use lifetime::{DisposerKey, Lifetime, WeakLifetime};
pub use listener::{IntoListenerResult, ListenerResult, ListenerShape, MessageHandler};
pub use message::{Message, RawMessage};
pub use publisher::Publisher;
pub use sink::{CollectingErrorSink, ErrorSink, TracingErrorSink};
pub use snapshot::{BusSnapshot, TopicSubscription};
pub use topic::{BroadcastDirection, Topic, TopicId};

// 允许在本 crate 内部通过 ::mbus_core 进行自引用，
// 以便过程宏在本 crate 的单元测试中也能解析到 ::mbus_core 路径。
extern crate self as mbus_core;
