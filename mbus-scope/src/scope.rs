use crate::config::ScopeConfig;
use crate::error::{ScopeError, ScopeResult};
use mbus_core::connection::ConnectionHandle;
use mbus_core::lifetime::Lifetime;
use mbus_core::listener::ListenerShape;
use mbus_core::publisher::Publisher;
use mbus_core::topic::Topic;
use mbus_core::MessageBus;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// 作用域层级
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    Application,
    Project,
    Module,
}

impl ScopeKind {
    /// 允许直接嵌套在本层级下的子层级
    fn child_kind(self) -> Option<ScopeKind> {
        match self {
            ScopeKind::Application => Some(ScopeKind::Project),
            ScopeKind::Project => Some(ScopeKind::Module),
            ScopeKind::Module => None,
        }
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScopeKind::Application => "application",
            ScopeKind::Project => "project",
            ScopeKind::Module => "module",
        };
        f.write_str(s)
    }
}

struct ScopeInner {
    kind: ScopeKind,
    name: String,
    path: String,
    bus: MessageBus,
    lifetime: Lifetime,
    parent: Weak<ScopeInner>,
    children: Mutex<Vec<Arc<ScopeInner>>>,
    disposed: AtomicBool,
}

impl ScopeInner {
    fn dispose(self: &Arc<Self>) -> ScopeResult<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Err(ScopeError::Disposed {
                scope: self.path.clone(),
            });
        }

        let mut first_error: Option<ScopeError> = None;

        let children = std::mem::take(&mut *self.children.lock());
        for child in children.iter().rev() {
            if let Err(err) = child.dispose() {
                first_error.get_or_insert(err);
            }
        }

        // 先释放绑定的连接，再释放总线
        self.lifetime.dispose();
        if let Err(err) = self.bus.dispose() {
            first_error.get_or_insert(err.into());
        }

        if let Some(parent) = self.parent.upgrade() {
            parent
                .children
                .lock()
                .retain(|child| !Arc::ptr_eq(child, self));
        }

        tracing::debug!(scope = %self.path, kind = %self.kind, "scope disposed");

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// 释放未能挂入父作用域的新作用域；其总线可能已随父总线释放
    fn abandon(&self) {
        self.disposed.store(true, Ordering::Release);
        self.lifetime.dispose();
        if !self.bus.is_disposed() {
            if let Err(err) = self.bus.dispose() {
                tracing::trace!(
                    scope = %self.path,
                    error = %err,
                    "abandoned scope bus disposed concurrently"
                );
            }
        }
        tracing::debug!(
            scope = %self.path,
            "scope abandoned, parent disposed while opening"
        );
    }
}

/// 作用域句柄（可克隆，克隆共享同一作用域）
///
/// ```rust
/// use mbus_scope::{Scope, ScopeConfig};
///
/// let app = Scope::application(ScopeConfig::builder().application("editor").build());
/// let project = app.open_project("demo").unwrap();
/// let module = project.open_module("core").unwrap();
/// assert_eq!(module.path(), "editor/demo/core");
///
/// app.dispose().unwrap();
/// assert!(module.is_disposed());
/// ```
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    /// 创建应用作用域（根总线 + 根生命周期）
    pub fn application(config: ScopeConfig) -> Self {
        let name = config.application().to_string();
        let bus = MessageBus::root(name.clone(), config.bus().clone());
        let lifetime = Lifetime::new(name.clone());

        tracing::debug!(scope = %name, "application scope opened");
        Self {
            inner: Arc::new(ScopeInner {
                kind: ScopeKind::Application,
                path: name.clone(),
                name,
                bus,
                lifetime,
                parent: Weak::new(),
                children: Mutex::new(Vec::new()),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// 在应用作用域下打开项目
    pub fn open_project(&self, name: impl Into<String>) -> ScopeResult<Scope> {
        self.open(ScopeKind::Project, name.into())
    }

    /// 在项目作用域下打开模块
    pub fn open_module(&self, name: impl Into<String>) -> ScopeResult<Scope> {
        self.open(ScopeKind::Module, name.into())
    }

    fn open(&self, kind: ScopeKind, name: String) -> ScopeResult<Scope> {
        self.ensure_open()?;
        if self.inner.kind.child_kind() != Some(kind) {
            return Err(ScopeError::InvalidNesting {
                parent: self.inner.kind,
                child: kind,
            });
        }

        let path = format!("{}/{}", self.inner.path, name);
        let bus = self.inner.bus.create_child(path.clone())?;
        let lifetime = self.inner.lifetime.child(path.clone());
        let child = Arc::new(ScopeInner {
            kind,
            name,
            path,
            bus,
            lifetime,
            parent: Arc::downgrade(&self.inner),
            children: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        });

        {
            let mut children = self.inner.children.lock();
            // 持锁复查：父作用域在此期间开始释放时不再挂入
            if !self.is_disposed() {
                children.push(child.clone());
                drop(children);
                tracing::debug!(scope = %child.path, kind = %kind, "scope opened");
                return Ok(Scope { inner: child });
            }
        }

        child.abandon();
        Err(ScopeError::Disposed {
            scope: self.inner.path.clone(),
        })
    }

    /// 建立随本作用域释放的连接
    pub fn connect(&self) -> ScopeResult<ConnectionHandle> {
        self.ensure_open()?;
        Ok(self.inner.bus.connect_with(&self.inner.lifetime)?)
    }

    /// 建立连接并订阅主题
    pub fn subscribe<L>(&self, topic: &Topic<L>, listener: Arc<L>) -> ScopeResult<ConnectionHandle>
    where
        L: ?Sized + ListenerShape,
    {
        let connection = self.connect()?;
        connection.subscribe(topic, listener)?;
        Ok(connection)
    }

    /// 本作用域总线上该主题的发布者
    pub fn publisher<L>(&self, topic: &Topic<L>) -> ScopeResult<Publisher<L>>
    where
        L: ?Sized + ListenerShape,
    {
        self.ensure_open()?;
        Ok(self.inner.bus.publisher(topic)?)
    }

    /// 释放本作用域及其全部子作用域
    pub fn dispose(&self) -> ScopeResult<()> {
        self.inner.dispose()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    pub fn kind(&self) -> ScopeKind {
        self.inner.kind
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// 以 `/` 连接的作用域路径
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn bus(&self) -> &MessageBus {
        &self.inner.bus
    }

    pub fn lifetime(&self) -> &Lifetime {
        &self.inner.lifetime
    }

    pub fn parent(&self) -> Option<Scope> {
        self.inner.parent.upgrade().map(|inner| Scope { inner })
    }

    pub fn children(&self) -> Vec<Scope> {
        self.inner
            .children
            .lock()
            .iter()
            .cloned()
            .map(|inner| Scope { inner })
            .collect()
    }

    fn ensure_open(&self) -> ScopeResult<()> {
        if self.is_disposed() {
            return Err(ScopeError::Disposed {
                scope: self.inner.path.clone(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("kind", &self.inner.kind)
            .field("path", &self.inner.path)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app() -> Scope {
        Scope::application(ScopeConfig::builder().application("app").build())
    }

    #[test]
    fn nesting_follows_application_project_module() {
        let app = app();
        let project = app.open_project("p").unwrap();
        let module = project.open_module("m").unwrap();

        assert_eq!(module.kind(), ScopeKind::Module);
        assert_eq!(module.path(), "app/p/m");
        assert_eq!(module.bus().order(), &[0, 0]);
        assert_eq!(module.parent().unwrap().path(), "app/p");

        assert!(matches!(
            app.open_module("m"),
            Err(ScopeError::InvalidNesting {
                parent: ScopeKind::Application,
                child: ScopeKind::Module
            })
        ));
        assert!(matches!(
            module.open_project("x"),
            Err(ScopeError::InvalidNesting { .. })
        ));
    }

    #[test]
    fn disposing_project_detaches_it_from_application() {
        let app = app();
        let project = app.open_project("p").unwrap();
        let module = project.open_module("m").unwrap();

        project.dispose().unwrap();
        assert!(module.is_disposed());
        assert!(module.bus().is_disposed());
        assert!(app.children().is_empty());
        assert!(app.bus().children().is_empty());

        assert!(matches!(
            project.dispose(),
            Err(ScopeError::Disposed { .. })
        ));
        assert!(matches!(
            project.open_module("late"),
            Err(ScopeError::Disposed { .. })
        ));
    }

    #[test]
    fn kind_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ScopeKind::Project).unwrap(),
            "\"project\""
        );
        assert_eq!(ScopeKind::Module.to_string(), "module");
    }
}
