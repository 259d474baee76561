use crate::message::Message;
use crate::{DispatchError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

/// A named unit of application logic run by a dispatcher worker.
///
/// `handle` runs to completion on the worker that owns the message's
/// partition; a slow handler only stalls its own partition.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, msg: Message);
}

/// Adapter turning an async closure into a [`Handler`]
pub struct HandlerFn<F>(F);

/// Wrap `f` so it can be registered as a handler
///
/// ```no_run
/// use wicket_dispatch::{handler_fn, Message};
///
/// let echo = handler_fn(|msg: Message| async move {
///     let _ = msg.reply_binary(msg.payload().to_vec());
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, msg: Message) {
        (self.0)(msg).await
    }
}

/// Maps message names to handlers
#[derive(Default)]
pub struct Router {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`.
    ///
    /// A second registration for the same name is a configuration error and
    /// is reported here rather than at dispatch time.
    pub fn register<H: Handler + 'static>(&mut self, name: impl Into<String>, handler: H) -> Result<()> {
        self.register_arc(name, Arc::new(handler))
    }

    /// Register an already shared handler
    pub fn register_arc(&mut self, name: impl Into<String>, handler: Arc<dyn Handler>) -> Result<()> {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(DispatchError::DuplicateHandler(name));
        }
        info!("Registering handler: {}", name);
        self.handlers.insert(name, handler);
        Ok(())
    }

    /// Look up the handler for a message name
    pub fn fetch(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("handlers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl Handler for Counting {
        async fn handle(&self, _msg: Message) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_register_and_fetch() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut router = Router::new();
        router.register("ping", Counting(hits.clone())).unwrap();

        assert!(router.contains("ping"));
        assert_eq!(router.len(), 1);

        let handler = router.fetch("ping").unwrap();
        handler.handle(Message::new("ping", 0, Vec::new())).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fetch_unknown() {
        let router = Router::new();
        assert!(router.fetch("missing").is_none());
        assert!(router.is_empty());
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut router = Router::new();
        router.register("ping", Counting(hits.clone())).unwrap();

        let err = router.register("ping", Counting(hits)).unwrap_err();
        assert!(matches!(err, DispatchError::DuplicateHandler(ref name) if name == "ping"));
        assert!(err.is_config());
        assert_eq!(router.len(), 1);
    }

    #[tokio::test]
    async fn test_handler_fn() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let mut router = Router::new();
        router
            .register(
                "add",
                handler_fn(move |msg: Message| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(msg.payload().len(), Ordering::SeqCst);
                    }
                }),
            )
            .unwrap();

        let handler = router.fetch("add").unwrap();
        handler.handle(Message::new("add", 0, vec![0u8; 3])).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
