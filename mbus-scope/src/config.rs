use bon::Builder;
use mbus_core::config::BusConfig;

/// 应用作用域配置
///
/// ```rust
/// use mbus_core::config::BusConfig;
/// use mbus_scope::config::ScopeConfig;
///
/// let config = ScopeConfig::builder()
///     .application("editor")
///     .bus(BusConfig::builder().drain_warn_threshold(10_000).build())
///     .build();
/// assert_eq!(config.application(), "editor");
/// ```
#[derive(Builder, Clone, Debug)]
pub struct ScopeConfig {
    /// 应用名称，同时作为根总线的 owner
    #[builder(into)]
    application: String,
    /// 根总线配置（整棵总线树共享）
    #[builder(default)]
    bus: BusConfig,
}

impl ScopeConfig {
    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn bus(&self) -> &BusConfig {
        &self.bus
    }
}
