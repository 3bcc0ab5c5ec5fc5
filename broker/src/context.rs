//! What a handler uses to answer: a [`Context`] wrapping whichever [`Responder`]
//! dispatched it (the broker on a worker, the hub in a single-process gateway).

use crate::error::Error;
use async_trait::async_trait;
use envelope::{Envelope, UserId};
use serde::Serialize;
use std::sync::Arc;

/// Delivery side of a dispatcher.
#[async_trait]
pub trait Responder: Send + Sync {
    /// Routes a reply or error envelope back toward the requester.
    async fn send_reply(&self, envelope: Envelope) -> Result<(), Error>;

    /// Fans an event out to connected clients. An event carrying a positive
    /// `user_id` only reaches that user's connections.
    async fn send_event(&self, envelope: Envelope) -> Result<(), Error>;
}

/// Handle passed to every action handler.
///
/// A handler should call exactly one of [`reply`](Context::reply) or
/// [`reply_error`](Context::reply_error) for the request it received, and may publish
/// events in addition. Returning without replying leaves the requester to time out.
#[derive(Clone)]
pub struct Context {
    responder: Arc<dyn Responder>,
}

impl Context {
    pub fn new(responder: Arc<dyn Responder>) -> Self {
        Self { responder }
    }

    pub async fn reply<T>(&self, original: &Envelope, data: &T) -> Result<(), Error>
    where
        T: Serialize + ?Sized + Sync,
    {
        let envelope = Envelope::reply(original, data)?;
        self.responder.send_reply(envelope).await
    }

    pub async fn reply_error(
        &self,
        original: &Envelope,
        code: u16,
        message: impl Into<String>,
    ) -> Result<(), Error> {
        let envelope = Envelope::error(original, code, message);
        self.responder.send_reply(envelope).await
    }

    /// Event for every connected client.
    pub async fn broadcast<T>(&self, action: &str, service: &str, data: &T) -> Result<(), Error>
    where
        T: Serialize + ?Sized + Sync,
    {
        let envelope = Envelope::event(action, service, data)?;
        self.responder.send_event(envelope).await
    }

    /// Event for every connection of one user.
    pub async fn notify_user<T>(
        &self,
        user_id: UserId,
        action: &str,
        service: &str,
        data: &T,
    ) -> Result<(), Error>
    where
        T: Serialize + ?Sized + Sync,
    {
        let mut envelope = Envelope::event(action, service, data)?;
        envelope.user_id = user_id;
        self.responder.send_event(envelope).await
    }
}
