use crate::context::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use envelope::Envelope;
use log::*;
use std::future::Future;
use std::sync::Arc;

/// Business logic behind one action name.
///
/// Handlers receive a fully stamped envelope: identity has been verified and written
/// by the hub. They validate `data` (typically with [`Envelope::parse_data`]), do their
/// work and answer through the [`Context`].
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope, ctx: Context);
}

#[async_trait]
impl<F, Fut> ActionHandler for F
where
    F: Fn(Envelope, Context) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, envelope: Envelope, ctx: Context) {
        (self)(envelope, ctx).await
    }
}

/// Process-local table from action name to handler.
///
/// Built at startup and read concurrently afterwards. Registering an action a second
/// time replaces the earlier handler; there is no fan-out per action.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: Arc<DashMap<String, Arc<dyn ActionHandler>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<H>(&self, action: impl Into<String>, handler: H)
    where
        H: ActionHandler + 'static,
    {
        let action = action.into();
        if self
            .handlers
            .insert(action.clone(), Arc::new(handler))
            .is_some()
        {
            warn!("Handler for action {action} replaced");
        } else {
            debug!("Registered handler for action {action}");
        }
    }

    pub fn get(&self, action: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers
            .get(action)
            .map(|handler| Arc::clone(handler.value()))
    }

    pub fn contains(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    /// Registered action names, sorted.
    pub fn actions(&self) -> Vec<String> {
        let mut actions: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        actions.sort();
        actions
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Runs the handler for `envelope.action` as an independent task so a slow handler
    /// never stalls the caller. Returns `false` when no handler is registered.
    pub fn dispatch(&self, envelope: Envelope, ctx: Context) -> bool {
        let Some(handler) = self.get(&envelope.action) else {
            return false;
        };
        trace!("Dispatching action {} ({})", envelope.action, envelope.id);
        tokio::spawn(async move {
            handler.handle(envelope, ctx).await;
        });
        true
    }
}
