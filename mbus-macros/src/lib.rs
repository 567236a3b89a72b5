use proc_macro::TokenStream;

mod listener;
mod utils;

/// 监听器宏
/// - 作用于 trait，补齐 `Send + Sync + 'static` 父约束
/// - 生成消息枚举 `<Trait>Message`：每个方法一个变体，字段即参数
/// - 为 `dyn Trait` 实现 `::mbus_core::listener::ListenerShape`
/// - 生成发布者 trait `<Trait>Publisher`，并为 `Publisher<dyn Trait>` 实现
/// - 支持参数：`#[listener(shape = "...", message = Ident, publisher = Ident)]`
///
/// 方法要求：接收者为 `&self`，参数为拥有所有权且实现 `Debug + Clone + Send + Sync + 'static` 的类型，
/// 返回 `()` 或 `Result<(), E>`（`E: Into<anyhow::Error>`）。
#[proc_macro_attribute]
pub fn listener(attr: TokenStream, item: TokenStream) -> TokenStream {
    listener::expand(attr, item)
}
