//! Hierarchical cancellation.
//!
//! A [`CancelScope`] is a node in an explicit tree. Cancelling a scope cancels every scope derived
//! from it with [`CancelScope::child`], transitively, while its parent and siblings are left
//! untouched. Dropping a scope never cancels it; only an explicit [`CancelScope::cancel`] does.

use std::{
    fmt,
    sync::{Arc, Mutex, Weak},
};

use tokio::sync::watch;

use crate::utils::lock;

struct ScopeInner {
    cancelled: watch::Sender<bool>,
    children: Mutex<Vec<Weak<ScopeInner>>>,
}

impl ScopeInner {
    fn new() -> Self {
        Self {
            cancelled: watch::Sender::new(false),
            children: Mutex::new(Vec::new()),
        }
    }

    fn cancel(&self) {
        let changed = self.cancelled.send_if_modified(|cancelled| match *cancelled {
            true => false,
            false => {
                *cancelled = true;
                true
            }
        });

        if !changed {
            return;
        }

        // The lock is released before recursing, so a child never waits on its parent's lock.
        let children = std::mem::take(&mut *lock(&self.children));
        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel();
            }
        }
    }
}

/// A cloneable handle to a node of the cancellation tree. Clones refer to the same node.
#[derive(Clone)]
pub struct CancelScope {
    inner: Arc<ScopeInner>,
}

impl CancelScope {
    /// Creates a new root scope, which is only ever cancelled explicitly.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ScopeInner::new()),
        }
    }

    /// Creates a scope that gets cancelled when this one is. If this scope is already cancelled,
    /// the returned scope is born cancelled.
    pub fn child(&self) -> CancelScope {
        let child = CancelScope::new();

        {
            let mut children = lock(&self.inner.children);
            if !self.is_cancelled() {
                children.retain(|weak| weak.strong_count() != 0);
                children.push(Arc::downgrade(&child.inner));
                return child;
            }
        }

        child.cancel();
        child
    }

    /// Cancels this scope and all of its descendants. Calling this more than once has no effect.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.borrow()
    }

    /// Completes once this scope is cancelled. Completes immediately if it already is.
    pub async fn cancelled(&self) {
        let mut receiver = self.inner.cancelled.subscribe();
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }

    /// Returns whether both handles refer to the same scope.
    pub fn ptr_eq(&self, other: &CancelScope) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelScope").field("cancelled", &self.is_cancelled()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::CancelScope;

    #[test]
    fn cancel_propagates_downwards_only() {
        let root = CancelScope::new();
        let child = root.child();
        let sibling = root.child();
        let grandchild = child.child();

        child.cancel();

        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
        assert!(!root.is_cancelled());
        assert!(!sibling.is_cancelled());
    }

    #[test]
    fn cancel_is_idempotent() {
        let root = CancelScope::new();
        let child = root.child();
        root.cancel();
        root.cancel();
        child.cancel();

        assert!(root.is_cancelled());
        assert!(child.is_cancelled());
    }

    #[test]
    fn child_of_cancelled_scope_is_born_cancelled() {
        let root = CancelScope::new();
        root.cancel();

        assert!(root.child().is_cancelled());
        assert!(root.child().child().is_cancelled());
    }

    #[test]
    fn dropping_does_not_cancel() {
        let root = CancelScope::new();
        let child = root.child();
        let observer = child.clone();
        drop(child);

        assert!(!observer.is_cancelled());
        root.cancel();
        assert!(observer.is_cancelled());
    }

    #[test]
    fn clones_share_the_same_node() {
        let scope = CancelScope::new();
        let clone = scope.clone();

        assert!(scope.ptr_eq(&clone));
        assert!(!scope.ptr_eq(&CancelScope::new()));

        clone.cancel();
        assert!(scope.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_wakes_waiters() {
        let root = CancelScope::new();
        let grandchild = root.child().child();

        let waiter = tokio::spawn(async move { grandchild.cancelled().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        root.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake up")
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_completes_immediately_when_already_cancelled() {
        let scope = CancelScope::new();
        scope.cancel();
        tokio::time::timeout(Duration::from_millis(100), scope.cancelled()).await.unwrap();
    }
}
