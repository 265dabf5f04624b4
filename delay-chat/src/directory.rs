//! Accounts and channels known to the server.
//!
//! The [`Directory`] is built once from [`DirectoryConfig`] and never changes
//! shape afterwards. What does change at runtime (live sessions and the
//! offline queue) sits behind one async mutex per account.
//!
//! Ownership runs one way: channels hold `Arc<Account>` subscribers, while
//! accounts only remember channel *names* and resolve them through the
//! directory. Sessions are stored as [`SessionHandle`]s, so nothing cycles.
//!
//! Whenever several accounts are locked at once (channel fan-out), they are
//! locked in ascending name order. Every other path locks a single account.

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::{Arc, Mutex as StdMutex, PoisonError},
};

use anyhow::{Result, bail};
use bytes::Bytes;
use tokio::sync::{Mutex, MutexGuard};

use crate::{
    config::{AccountConfig, DirectoryConfig, OFFLINE_MESSAGES},
    session::{SessionHandle, SessionId},
};

pub struct Directory {
    accounts: HashMap<String, Arc<Account>>,
    channels: HashMap<String, Arc<Channel>>,
}

impl Directory {
    pub fn from_config(config: &DirectoryConfig) -> Result<Self> {
        let mut memberships: HashMap<&str, Vec<String>> = HashMap::new();
        for account in &config.accounts {
            if memberships.insert(account.name.as_str(), Vec::new()).is_some() {
                bail!("account {} is configured more than once", account.name);
            }
        }

        let mut channel_members: Vec<(&str, BTreeSet<&str>)> = Vec::new();
        for channel in &config.channels {
            if channel_members.iter().any(|(name, _)| *name == channel.name) {
                bail!("channel {} is configured more than once", channel.name);
            }
            let mut members = BTreeSet::new();
            for member in &channel.members {
                let Some(joined) = memberships.get_mut(member.as_str()) else {
                    bail!(
                        "channel {} lists unknown account {}",
                        channel.name,
                        member
                    );
                };
                if members.insert(member.as_str()) {
                    joined.push(channel.name.clone());
                }
            }
            channel_members.push((channel.name.as_str(), members));
        }

        let accounts: HashMap<String, Arc<Account>> = config
            .accounts
            .iter()
            .map(|account| {
                let joined = memberships.remove(account.name.as_str()).unwrap_or_default();
                (
                    account.name.clone(),
                    Arc::new(Account::from_config(account, joined)),
                )
            })
            .collect();

        let channels = channel_members
            .into_iter()
            .map(|(name, members)| {
                // BTreeSet iteration keeps subscribers in lock order.
                let subscribers = members
                    .into_iter()
                    .filter_map(|member| accounts.get(member).cloned())
                    .collect();
                (
                    name.to_string(),
                    Arc::new(Channel {
                        name: name.to_string(),
                        subscribers,
                    }),
                )
            })
            .collect();

        Ok(Self { accounts, channels })
    }

    pub fn empty() -> Self {
        Self {
            accounts: HashMap::new(),
            channels: HashMap::new(),
        }
    }

    pub fn find_account(&self, name: &str) -> Option<Arc<Account>> {
        self.accounts.get(name).cloned()
    }

    pub fn find_channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.get(name).cloned()
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

pub struct Account {
    name: String,
    credential: String,
    permissions: BTreeSet<String>,
    options: BTreeSet<String>,
    memberships: Vec<String>,
    state: Mutex<AccountState>,
}

impl Account {
    pub fn from_config(config: &AccountConfig, memberships: Vec<String>) -> Self {
        Self {
            name: config.name.clone(),
            credential: config.password.clone(),
            permissions: config.permissions.iter().cloned().collect(),
            options: config.options.iter().cloned().collect(),
            memberships,
            state: Mutex::new(AccountState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capability tokens granted by the config. No command checks them yet.
    pub fn permissions(&self) -> &BTreeSet<String> {
        &self.permissions
    }

    pub fn has_option(&self, option: &str) -> bool {
        self.options.contains(option)
    }

    pub fn accepts_offline_messages(&self) -> bool {
        self.has_option(OFFLINE_MESSAGES)
    }

    /// Names of the channels this account subscribes to, in config order.
    pub fn memberships(&self) -> &[String] {
        &self.memberships
    }

    pub fn verify_credential(&self, attempt: &str) -> bool {
        constant_time_eq(attempt.as_bytes(), self.credential.as_bytes())
    }

    pub async fn lock(&self) -> MutexGuard<'_, AccountState> {
        self.state.lock().await
    }

    pub async fn live_session_count(&self) -> usize {
        self.lock().await.sessions.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.lock().await.queue.len()
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("name", &self.name)
            .field("permissions", &self.permissions)
            .field("options", &self.options)
            .field("memberships", &self.memberships)
            .finish_non_exhaustive()
    }
}

/// Mutable per-account state, reached only through [`Account::lock`].
#[derive(Default)]
pub struct AccountState {
    sessions: Vec<SessionHandle>,
    queue: VecDeque<Arc<PendingMessage>>,
}

impl AccountState {
    pub fn sessions(&self) -> &[SessionHandle] {
        &self.sessions
    }

    pub fn is_online(&self) -> bool {
        !self.sessions.is_empty()
    }

    pub fn queue(&self) -> &VecDeque<Arc<PendingMessage>> {
        &self.queue
    }

    pub(crate) fn attach(&mut self, handle: SessionHandle) {
        if !self.sessions.iter().any(|live| live.id() == handle.id()) {
            self.sessions.push(handle);
        }
    }

    pub(crate) fn detach(&mut self, id: SessionId) -> bool {
        let before = self.sessions.len();
        self.sessions.retain(|live| live.id() != id);
        self.sessions.len() != before
    }

    pub(crate) fn enqueue(&mut self, pending: Arc<PendingMessage>) {
        self.queue.push_back(pending);
    }

    pub(crate) fn take_queue(&mut self) -> VecDeque<Arc<PendingMessage>> {
        std::mem::take(&mut self.queue)
    }
}

#[derive(Debug)]
pub struct Channel {
    name: String,
    subscribers: Vec<Arc<Account>>,
}

impl Channel {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribers sorted by account name.
    pub fn subscribers(&self) -> &[Arc<Account>] {
        &self.subscribers
    }

    pub fn roster(&self) -> String {
        self.subscribers
            .iter()
            .map(|account| account.name())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// An encoded message waiting for one or more offline accounts.
///
/// A channel broadcast queued for several accounts shares a single instance
/// across all of their queues; each account removes itself from
/// `remaining` when the payload reaches it.
#[derive(Debug)]
pub struct PendingMessage {
    payload: Bytes,
    remaining: StdMutex<BTreeSet<String>>,
}

impl PendingMessage {
    pub fn new<I, S>(payload: Bytes, targets: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Arc::new(Self {
            payload,
            remaining: StdMutex::new(targets.into_iter().map(Into::into).collect()),
        })
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn remaining_targets(&self) -> BTreeSet<String> {
        self.remaining
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Records delivery to `account`; returns true once nobody is left.
    pub fn mark_delivered(&self, account: &str) -> bool {
        let mut remaining = self.remaining.lock().unwrap_or_else(PoisonError::into_inner);
        remaining.remove(account);
        remaining.is_empty()
    }
}

/// Compares two byte slices without short-circuiting on the first mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
