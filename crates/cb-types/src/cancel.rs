use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

#[derive(Debug, Default)]
struct Inner {
    flag: AtomicBool,
    children: Mutex<Vec<Weak<Inner>>>,
}

impl Inner {
    fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let mut children = self.children.lock();
        children.retain(|child| match child.upgrade() {
            Some(child) => {
                child.cancel();
                true
            }
            None => false,
        });
    }
}

/// Cooperative cancellation flag shared between a controller and the
/// strategy loop it drives.
///
/// Clones observe the same flag. Raising it is idempotent, safe from any
/// thread, and also raises every live [`CancellationToken::child`].
/// Clearing only resets this token: a child raised before the clear stays
/// raised, so a run abandoned under one flag cannot be revived by the next.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new token raised whenever this one is. Starts raised if this token
    /// already is.
    pub fn child(&self) -> Self {
        let child = Self::new();
        let mut children = self.inner.children.lock();
        children.retain(|c| c.strong_count() > 0);
        children.push(Arc::downgrade(&child.inner));
        // Checked under the children lock so a concurrent cancel either sees
        // the child or has already set the flag read here.
        if self.is_cancelled() {
            child.inner.flag.store(true, Ordering::SeqCst);
        }
        child
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn clear(&self) {
        self.inner.flag.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_flag() {
        let token = CancellationToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());

        token.cancel();
        token.cancel();
        assert!(observer.is_cancelled());

        observer.clear();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_cancel_from_other_thread() {
        let token = CancellationToken::new();
        let remote = token.clone();
        std::thread::spawn(move || remote.cancel())
            .join()
            .expect("cancel thread panicked");
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_child_follows_parent_but_survives_clear() {
        let parent = CancellationToken::new();
        let run = parent.child();
        assert!(!run.is_cancelled());

        parent.cancel();
        assert!(run.is_cancelled());

        parent.clear();
        assert!(!parent.is_cancelled());
        assert!(run.is_cancelled(), "clearing the parent must not revive a raised child");

        let next = parent.child();
        assert!(!next.is_cancelled());
        next.cancel();
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_child_of_raised_parent_starts_raised() {
        let parent = CancellationToken::new();
        parent.cancel();
        assert!(parent.child().is_cancelled());
    }

    #[test]
    fn test_grandchildren_and_dropped_children() {
        let root = CancellationToken::new();
        let child = root.child();
        let grandchild = child.child();
        drop(root.child());
        root.cancel();
        assert!(grandchild.is_cancelled());
        assert_eq!(root.inner.children.lock().len(), 1);
    }
}
