//! 总线配置（BusConfig）
//!
//! 由根总线持有，整棵总线树共享。
//!
use crate::sink::{ErrorSink, TracingErrorSink};
use bon::Builder;
use std::fmt;
use std::sync::Arc;

/// 总线配置
///
/// ```
/// use mbus_core::config::BusConfig;
///
/// let config = BusConfig::builder()
///     .catch_listener_panics(false)
///     .drain_warn_threshold(1_000)
///     .build();
/// assert!(!config.catch_listener_panics());
/// assert_eq!(config.drain_warn_threshold(), 1_000);
/// ```
#[derive(Builder, Clone)]
pub struct BusConfig {
    /// 完整性违规的上报出口
    #[builder(default = default_error_sink())]
    error_sink: Arc<dyn ErrorSink>,
    /// 是否把监听器 panic 转为 `ListenerFailure`（否则 panic 直接向上传播）
    #[builder(default = true)]
    catch_listener_panics: bool,
    /// 单次排空投递数超过该值时输出一次 warn 日志
    #[builder(default = 100_000)]
    drain_warn_threshold: usize,
}

fn default_error_sink() -> Arc<dyn ErrorSink> {
    Arc::new(TracingErrorSink)
}

impl BusConfig {
    pub fn error_sink(&self) -> &Arc<dyn ErrorSink> {
        &self.error_sink
    }

    pub fn catch_listener_panics(&self) -> bool {
        self.catch_listener_panics
    }

    pub fn drain_warn_threshold(&self) -> usize {
        self.drain_warn_threshold
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl fmt::Debug for BusConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusConfig")
            .field("catch_listener_panics", &self.catch_listener_panics)
            .field("drain_warn_threshold", &self.drain_warn_threshold)
            .finish_non_exhaustive()
    }
}
