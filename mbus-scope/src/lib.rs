//! 作用域树（mbus-scope）
//!
//! 按“应用 → 项目 → 模块”组织作用域，每个作用域拥有一条总线与一个生命周期：
//! - 在作用域上建立的连接随作用域释放而释放；
//! - 释放作用域时先释放子作用域，再释放自身的连接与总线。
//!
pub mod config;
pub mod error;
pub mod scope;

pub use config::ScopeConfig;
pub use error::{ScopeError, ScopeResult};
pub use scope::{Scope, ScopeKind};
