//! A named, addressable peer in the overlay.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

/// Identity `(router, context_id)`. Two contexts compare equal iff they
/// share a router and ID; `router` is the `Arc` pointer identity of the
/// owning [`crate::router::Router`].
#[derive(Clone)]
pub struct Context {
    router: usize,
    id: u32,
    inner: Arc<Inner>,
}

struct Inner {
    name: Mutex<Option<String>>,
    /// Set for indirect (proxy-connected) children: the context through
    /// which this one was reached.
    via: Option<Context>,
    disconnected: Notify,
}

impl Context {
    pub fn new(router: usize, id: u32, via: Option<Context>) -> Self {
        Self {
            router,
            id,
            inner: Arc::new(Inner {
                name: Mutex::new(None),
                via,
                disconnected: Notify::new(),
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn via(&self) -> Option<&Context> {
        self.inner.via.as_ref()
    }

    pub fn name(&self) -> Option<String> {
        self.inner.name.lock().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.inner.name.lock() = Some(name.into());
    }

    /// Fires the `disconnect` event, waking every waiter blocked in
    /// [`Context::disconnected`].
    pub fn notify_disconnected(&self) {
        self.inner.disconnected.notify_waiters();
    }

    /// Resolves once this context's route has been deleted.
    pub async fn disconnected(&self) {
        self.inner.disconnected.notified().await;
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.router == other.router && self.id == other.id
    }
}

impl Eq for Context {}

impl std::hash::Hash for Context {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.router.hash(state);
        self.id.hash(state);
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("name", &self.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_requires_same_router_and_id() {
        let a = Context::new(1, 5, None);
        let b = Context::new(1, 5, None);
        let c = Context::new(2, 5, None);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn disconnect_wakes_waiters() {
        let context = Context::new(1, 5, None);
        let waiter = context.clone();
        let handle = tokio::spawn(async move {
            waiter.disconnected().await;
        });
        tokio::task::yield_now().await;
        context.notify_disconnected();
        handle.await.unwrap();
    }
}
