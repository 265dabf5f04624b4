use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{
    directory::{Account, AccountState},
    error::UserError,
    message::Message,
};

pub type SessionId = u64;

/// Cloneable write side of a session, stored in its account's live set.
///
/// Payloads go through an unbounded channel to the connection's writer task,
/// so fan-out never waits on a slow peer.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    outbound: mpsc::UnboundedSender<Bytes>,
}

#[derive(Debug, thiserror::Error)]
#[error("session {0} is no longer writable")]
pub struct SessionClosed(pub SessionId);

impl SessionHandle {
    pub fn new(id: SessionId, outbound: mpsc::UnboundedSender<Bytes>) -> Self {
        Self { id, outbound }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn send(&self, payload: Bytes) -> Result<(), SessionClosed> {
        self.outbound
            .send(payload)
            .map_err(|_| SessionClosed(self.id))
    }

    /// Resolves once the writer side has stopped accepting payloads.
    pub async fn closed(&self) {
        self.outbound.closed().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
    Closed,
}

/// One connection, bound to at most one account for its whole life.
pub struct Session {
    handle: SessionHandle,
    account: Option<Arc<Account>>,
    closed: bool,
}

impl Session {
    pub fn new(id: SessionId, outbound: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            handle: SessionHandle::new(id, outbound),
            account: None,
            closed: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.handle.id
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn account(&self) -> Option<&Arc<Account>> {
        self.account.as_ref()
    }

    pub fn state(&self) -> SessionState {
        match (&self.account, self.closed) {
            (_, true) => SessionState::Closed,
            (Some(_), false) => SessionState::Authenticated,
            (None, false) => SessionState::Unauthenticated,
        }
    }

    /// Writes a direct reply to this session only.
    pub fn reply(&self, message: &Message) {
        if let Err(err) = self.handle.send(message.encode()) {
            debug!(session = self.id(), error = %err, command = message.command(), "dropping reply");
        }
    }

    /// Binds the session to `account` and joins its live set.
    ///
    /// `state` must be the guard of that same account, so the binding and
    /// whatever the caller does next under the guard are atomic.
    pub fn bind(&mut self, account: Arc<Account>, state: &mut AccountState) -> Result<(), UserError> {
        if let Some(current) = &self.account {
            return Err(UserError::AlreadyLoggedIn(current.name().to_string()));
        }
        state.attach(self.handle.clone());
        info!(
            session = self.id(),
            account = account.name(),
            permissions = ?account.permissions(),
            "session authenticated"
        );
        self.account = Some(account);
        Ok(())
    }

    /// Leaves the bound account's live set. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(account) = &self.account {
            account.lock().await.detach(self.id());
        }
    }
}
