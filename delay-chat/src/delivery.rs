//! Fan-out of encoded messages to live sessions and offline queues.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::{
    directory::{Account, AccountState, Channel, Directory, PendingMessage},
    error::UserError,
    message::Message,
    session::SessionHandle,
};

/// Sent after the last `JOIN` of a login burst.
pub const END_ROSTER: &str = "END_ROSTER";
/// Sent after the last queued message of a login burst.
pub const END_OFFLINE_MESSAGES: &str = "END_OFFLINE_MESSAGES";

/// Outcome of a channel broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelDelivery {
    /// Sessions the payload was written to.
    pub sessions: usize,
    /// Offline accounts that now hold the shared pending message.
    pub queued: usize,
    /// Offline accounts that refuse offline messages.
    pub skipped: usize,
}

/// Delivers `message` to every live session of `account`.
///
/// With no live session the message is queued when `delayable` is set and
/// the account accepts offline messages; otherwise it is undeliverable.
/// Sessions whose writer is already gone count as absent. Returns how many
/// sessions received it (0 when queued).
pub async fn deliver_to_account(
    account: &Account,
    message: &Message,
    delayable: bool,
) -> Result<usize, UserError> {
    let payload = message.encode();
    let mut state = account.lock().await;

    if state.is_online() {
        let delivered = write_to_sessions(account.name(), state.sessions(), &payload);
        if delivered > 0 {
            return Ok(delivered);
        }
    }
    if !delayable {
        return Err(UserError::Undeliverable(format!(
            "{} is offline and the message cannot be delayed",
            account.name()
        )));
    }
    if !account.accepts_offline_messages() {
        return Err(UserError::Undeliverable(format!(
            "{} is offline and does not accept offline messages",
            account.name()
        )));
    }

    state.enqueue(PendingMessage::new(payload, [account.name()]));
    debug!(account = account.name(), queued = state.queue().len(), "queued offline message");
    Ok(0)
}

/// Broadcasts `message` to every subscriber of `channel`.
///
/// All subscribers are locked together (in name order) so the split between
/// live and offline accounts cannot change halfway through. Offline
/// subscribers that accept offline messages share one [`PendingMessage`];
/// the others silently miss the broadcast.
pub async fn deliver_to_channel(channel: &Channel, message: &Message) -> ChannelDelivery {
    let payload = message.encode();

    let mut guards = Vec::with_capacity(channel.subscribers().len());
    for account in channel.subscribers() {
        guards.push(account.lock().await);
    }

    let mut report = ChannelDelivery::default();
    let mut inactive = Vec::new();
    for (account, state) in channel.subscribers().iter().zip(guards.iter_mut()) {
        if state.is_online() {
            let delivered = write_to_sessions(account.name(), state.sessions(), &payload);
            if delivered > 0 {
                report.sessions += delivered;
                continue;
            }
        }
        if account.accepts_offline_messages() {
            inactive.push((account, state));
        } else {
            report.skipped += 1;
        }
    }

    if !inactive.is_empty() {
        let pending = PendingMessage::new(
            payload,
            inactive.iter().map(|(account, _)| account.name()),
        );
        for (_, state) in inactive.iter_mut() {
            state.enqueue(Arc::clone(&pending));
        }
        report.queued = inactive.len();
    }

    debug!(
        channel = channel.name(),
        sessions = report.sessions,
        queued = report.queued,
        skipped = report.skipped,
        "channel broadcast"
    );
    report
}

/// Catch-up sequence for a session that has just logged in.
///
/// Must run under the same account guard that bound the session, before any
/// other delivery can reach it: one `JOIN` per channel membership, then
/// [`END_ROSTER`], then every queued payload in arrival order, then
/// [`END_OFFLINE_MESSAGES`].
pub fn login_burst(
    directory: &Directory,
    account: &Account,
    state: &mut AccountState,
    session: &SessionHandle,
) {
    for name in account.memberships() {
        let Some(channel) = directory.find_channel(name) else {
            continue;
        };
        let join = Message::new("JOIN")
            .with("CHANNEL", channel.name())
            .with("USERS", channel.roster());
        send_or_log(account.name(), session, join.encode());
    }
    send_or_log(account.name(), session, Message::new(END_ROSTER).encode());

    let queue = state.take_queue();
    let drained = queue.len();
    for pending in queue {
        send_or_log(account.name(), session, pending.payload().clone());
        pending.mark_delivered(account.name());
    }
    if drained > 0 {
        debug!(account = account.name(), drained, "delivered offline messages");
    }

    send_or_log(
        account.name(),
        session,
        Message::new(END_OFFLINE_MESSAGES).encode(),
    );
}

// A failed write affects only that session; siblings still get the payload.
fn write_to_sessions(account: &str, sessions: &[SessionHandle], payload: &Bytes) -> usize {
    sessions
        .iter()
        .filter(|session| send_or_log(account, session, payload.clone()))
        .count()
}

fn send_or_log(account: &str, session: &SessionHandle, payload: Bytes) -> bool {
    match session.send(payload) {
        Ok(()) => true,
        Err(err) => {
            debug!(account, error = %err, "failed to deliver to session");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccountConfig, ChannelConfig, DirectoryConfig, OFFLINE_MESSAGES};
    use tokio::sync::mpsc;

    fn directory() -> Directory {
        Directory::from_config(&DirectoryConfig {
            accounts: vec![
                AccountConfig::new("alice", "pw").with_option(OFFLINE_MESSAGES),
                AccountConfig::new("bob", "pw"),
                AccountConfig::new("carol", "pw").with_option(OFFLINE_MESSAGES),
                AccountConfig::new("dave", "pw").with_option(OFFLINE_MESSAGES),
            ],
            channels: vec![
                ChannelConfig::new("general", &["alice", "bob", "carol", "dave"]),
                ChannelConfig::new("side", &["alice", "carol"]),
            ],
        })
        .expect("valid directory")
    }

    async fn attach(account: &Account, id: u64) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        account.lock().await.attach(SessionHandle::new(id, tx));
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(payload) = rx.try_recv() {
            out.push(Message::decode(&payload).unwrap().unwrap());
        }
        out
    }

    fn chat(text: &str) -> Message {
        Message::new("CHANMSG")
            .with("SOURCE", "bob")
            .with("TARGET", "general")
            .with("MESSAGE", text)
    }

    #[tokio::test]
    async fn delivers_to_every_live_session() {
        let directory = directory();
        let bob = directory.find_account("bob").unwrap();
        let mut first = attach(&bob, 1).await;
        let mut second = attach(&bob, 2).await;

        let delivered = deliver_to_account(&bob, &chat("hi"), false).await.unwrap();

        assert_eq!(delivered, 2);
        assert_eq!(drain(&mut first), vec![chat("hi")]);
        assert_eq!(drain(&mut second), vec![chat("hi")]);
    }

    #[tokio::test]
    async fn closed_session_does_not_block_siblings() {
        let directory = directory();
        let bob = directory.find_account("bob").unwrap();
        let gone = attach(&bob, 1).await;
        drop(gone);
        let mut live = attach(&bob, 2).await;

        let delivered = deliver_to_account(&bob, &chat("hi"), false).await.unwrap();

        assert_eq!(delivered, 1);
        assert_eq!(drain(&mut live).len(), 1);
    }

    #[tokio::test]
    async fn account_with_only_dead_sessions_is_treated_as_offline() {
        let directory = directory();
        let alice = directory.find_account("alice").unwrap();
        drop(attach(&alice, 1).await);

        let delivered = deliver_to_account(&alice, &chat("later"), true).await.unwrap();

        assert_eq!(delivered, 0);
        assert_eq!(alice.pending_count().await, 1);

        let bob = directory.find_account("bob").unwrap();
        drop(attach(&bob, 2).await);
        let err = deliver_to_account(&bob, &chat("later"), true).await.unwrap_err();
        assert_eq!(err.kind(), "ERR_MSG_UNDELIVERABLE");
    }

    #[tokio::test]
    async fn channel_broadcast_queues_for_members_with_dead_sessions() {
        let directory = directory();
        let general = directory.find_channel("general").unwrap();
        let carol = directory.find_account("carol").unwrap();
        drop(attach(&carol, 1).await);

        let report = deliver_to_channel(&general, &chat("hello")).await;

        assert_eq!(report.sessions, 0);
        assert_eq!(report.queued, 3);
        assert_eq!(carol.pending_count().await, 1);
    }

    #[tokio::test]
    async fn offline_accepting_account_queues_exactly_one_message() {
        let directory = directory();
        let alice = directory.find_account("alice").unwrap();

        let delivered = deliver_to_account(&alice, &chat("later"), true).await.unwrap();

        assert_eq!(delivered, 0);
        let state = alice.lock().await;
        assert_eq!(state.queue().len(), 1);
        assert_eq!(
            state.queue()[0].remaining_targets().into_iter().collect::<Vec<_>>(),
            vec!["alice".to_string()]
        );
    }

    #[tokio::test]
    async fn offline_refusing_account_is_undeliverable() {
        let directory = directory();
        let bob = directory.find_account("bob").unwrap();

        let err = deliver_to_account(&bob, &chat("later"), true).await.unwrap_err();

        assert_eq!(err.kind(), "ERR_MSG_UNDELIVERABLE");
        assert_eq!(bob.pending_count().await, 0);
    }

    #[tokio::test]
    async fn non_delayable_message_to_offline_account_fails() {
        let directory = directory();
        let alice = directory.find_account("alice").unwrap();

        let err = deliver_to_account(&alice, &chat("now"), false).await.unwrap_err();

        assert_eq!(err.kind(), "ERR_MSG_UNDELIVERABLE");
        assert_eq!(alice.pending_count().await, 0);
    }

    #[tokio::test]
    async fn channel_broadcast_shares_one_pending_message() {
        let directory = directory();
        let general = directory.find_channel("general").unwrap();
        let bob = directory.find_account("bob").unwrap();
        let mut bob_rx = attach(&bob, 1).await;

        let report = deliver_to_channel(&general, &chat("hello")).await;

        assert_eq!(
            report,
            ChannelDelivery {
                sessions: 1,
                queued: 3,
                skipped: 0
            }
        );
        assert_eq!(drain(&mut bob_rx), vec![chat("hello")]);

        let mut queued = Vec::new();
        for name in ["alice", "carol", "dave"] {
            let account = directory.find_account(name).unwrap();
            let state = account.lock().await;
            assert_eq!(state.queue().len(), 1);
            queued.push(Arc::clone(&state.queue()[0]));
        }
        assert!(Arc::ptr_eq(&queued[0], &queued[1]));
        assert!(Arc::ptr_eq(&queued[1], &queued[2]));
        assert_eq!(queued[0].remaining_targets().len(), 3);
    }

    #[tokio::test]
    async fn channel_broadcast_skips_offline_refusers_silently() {
        let directory = directory();
        let general = directory.find_channel("general").unwrap();

        let report = deliver_to_channel(&general, &chat("anyone?")).await;

        assert_eq!(report.skipped, 1);
        assert_eq!(report.queued, 3);
        assert_eq!(directory.find_account("bob").unwrap().pending_count().await, 0);
    }

    #[tokio::test]
    async fn draining_every_target_releases_the_shared_message() {
        let directory = directory();
        let general = directory.find_channel("general").unwrap();
        deliver_to_channel(&general, &chat("hello")).await;

        let weak = {
            let alice = directory.find_account("alice").unwrap();
            let state = alice.lock().await;
            Arc::downgrade(&state.queue()[0])
        };

        for (id, name) in ["alice", "carol", "dave"].into_iter().enumerate() {
            let account = directory.find_account(name).unwrap();
            let (tx, _rx) = mpsc::unbounded_channel();
            let handle = SessionHandle::new(id as u64, tx);
            let mut state = account.lock().await;
            state.attach(handle.clone());
            login_burst(&directory, &account, &mut state, &handle);
            assert!(state.queue().is_empty());
        }

        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn login_burst_sends_rosters_then_queue_in_order() {
        let directory = directory();
        let alice = directory.find_account("alice").unwrap();
        deliver_to_account(&alice, &chat("first"), true).await.unwrap();
        deliver_to_account(&alice, &chat("second"), true).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = SessionHandle::new(9, tx);
        {
            let mut state = alice.lock().await;
            state.attach(handle.clone());
            login_burst(&directory, &alice, &mut state, &handle);
        }

        let burst = drain(&mut rx);
        assert_eq!(
            burst,
            vec![
                Message::new("JOIN")
                    .with("CHANNEL", "general")
                    .with("USERS", "alice,bob,carol,dave"),
                Message::new("JOIN")
                    .with("CHANNEL", "side")
                    .with("USERS", "alice,carol"),
                Message::new(END_ROSTER),
                chat("first"),
                chat("second"),
                Message::new(END_OFFLINE_MESSAGES),
            ]
        );
        assert_eq!(alice.pending_count().await, 0);
    }
}
