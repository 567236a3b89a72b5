//! 生命周期（Lifetime）
//!
//! 一棵“释放动作”树：`register` 登记释放动作，`child` 创建嵌套生命周期。
//! `dispose` 先逆序释放子生命周期，再按登记的逆序执行自身的动作；
//! 最后一个句柄被丢弃时自动释放。重复释放为空操作。
//!
//! 单独释放的子生命周期会从父生命周期中摘除；
//! `register` 返回的 [`DisposerKey`] 可用于撤销尚未执行的释放动作。
//!
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Disposer = Box<dyn FnOnce() + Send>;

/// 已登记释放动作的键，用于 [`Lifetime::unregister`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DisposerKey(u64);

struct LifetimeInner {
    name: String,
    parent: Weak<LifetimeInner>,
    children: Mutex<Vec<Arc<LifetimeInner>>>,
    disposers: Mutex<Vec<(DisposerKey, Disposer)>>,
    next_key: AtomicU64,
    disposed: AtomicBool,
}

impl LifetimeInner {
    fn new(name: String, parent: Weak<LifetimeInner>) -> Self {
        Self {
            name,
            parent,
            children: Mutex::new(Vec::new()),
            disposers: Mutex::new(Vec::new()),
            next_key: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let children = std::mem::take(&mut *self.children.lock());
        for child in children.iter().rev() {
            child.dispose();
        }

        let disposers = std::mem::take(&mut *self.disposers.lock());
        let count = disposers.len();
        for (_, disposer) in disposers.into_iter().rev() {
            disposer();
        }

        if let Some(parent) = self.parent.upgrade() {
            parent
                .children
                .lock()
                .retain(|child| !std::ptr::eq(Arc::as_ptr(child), self));
        }

        tracing::trace!(
            lifetime = %self.name,
            disposers = count,
            children = children.len(),
            "lifetime disposed"
        );
    }
}

impl Drop for LifetimeInner {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// 生命周期句柄（可克隆，共享同一棵子树）
#[derive(Clone)]
pub struct Lifetime {
    inner: Arc<LifetimeInner>,
}

impl Lifetime {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(LifetimeInner::new(name.into(), Weak::new())),
        }
    }

    /// 创建嵌套生命周期，随本生命周期一起释放
    ///
    /// 本生命周期已释放时，返回的子生命周期同样处于已释放状态。
    pub fn child(&self, name: impl Into<String>) -> Lifetime {
        let child = Arc::new(LifetimeInner::new(
            name.into(),
            Arc::downgrade(&self.inner),
        ));
        {
            let mut children = self.inner.children.lock();
            if !self.inner.is_disposed() {
                children.push(child.clone());
                return Lifetime { inner: child };
            }
        }
        child.dispose();
        Lifetime { inner: child }
    }

    /// 登记释放动作；生命周期已释放时立即执行
    pub fn register(&self, disposer: impl FnOnce() + Send + 'static) -> DisposerKey {
        let key = DisposerKey(self.inner.next_key.fetch_add(1, Ordering::Relaxed));
        {
            let mut disposers = self.inner.disposers.lock();
            if !self.inner.is_disposed() {
                disposers.push((key, Box::new(disposer)));
                return key;
            }
        }
        disposer();
        key
    }

    /// 撤销尚未执行的释放动作（动作本身被丢弃而不执行）
    ///
    /// 动作已执行或已撤销时返回 `false`。
    pub fn unregister(&self, key: DisposerKey) -> bool {
        let removed = {
            let mut disposers = self.inner.disposers.lock();
            disposers
                .iter()
                .position(|(registered, _)| *registered == key)
                .map(|index| disposers.remove(index))
        };
        // 在锁外丢弃，动作捕获的值析构时可能再次访问本生命周期
        removed.is_some()
    }

    /// 尚未执行的释放动作数
    pub fn disposer_count(&self) -> usize {
        self.inner.disposers.lock().len()
    }

    /// 仍挂在本生命周期下的子生命周期数
    pub fn child_count(&self) -> usize {
        self.inner.children.lock().len()
    }

    pub fn downgrade(&self) -> WeakLifetime {
        WeakLifetime {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

/// 不延长生命周期的弱引用
#[derive(Clone, Debug)]
pub struct WeakLifetime {
    inner: Weak<LifetimeInner>,
}

impl WeakLifetime {
    pub fn upgrade(&self) -> Option<Lifetime> {
        self.inner.upgrade().map(|inner| Lifetime { inner })
    }
}

impl fmt::Debug for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifetime")
            .field("name", &self.inner.name)
            .field("disposed", &self.inner.is_disposed())
            .finish()
    }
}
