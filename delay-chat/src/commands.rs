//! Command table and handlers.
//!
//! Commands are matched case-insensitively against [`Command::ALL`]. Only
//! commands flagged as pre-login run on an unauthenticated session; anything
//! else is refused with `ERR_NOT_LOGGED_IN` and has no effect.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::{debug, info};

use crate::{
    delivery,
    directory::Directory,
    error::UserError,
    message::Message,
    session::Session,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Help,
    Login,
    Ping,
    Privmsg,
    Chanmsg,
}

impl Command {
    pub const ALL: [Command; 5] = [
        Command::Help,
        Command::Login,
        Command::Ping,
        Command::Privmsg,
        Command::Chanmsg,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Command::Help => "HELP",
            Command::Login => "LOGIN",
            Command::Ping => "PING",
            Command::Privmsg => "PRIVMSG",
            Command::Chanmsg => "CHANMSG",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|command| command.name().eq_ignore_ascii_case(name))
    }

    pub fn allowed_before_login(self) -> bool {
        matches!(self, Command::Help | Command::Login | Command::Ping)
    }
}

/// Routes decoded messages from any connection to their handlers.
pub struct Dispatcher {
    directory: Arc<Directory>,
}

impl Dispatcher {
    pub fn new(directory: Arc<Directory>) -> Self {
        Self { directory }
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Runs `message` and answers the session with an error line if it fails.
    pub async fn handle(&self, session: &mut Session, message: &Message) {
        if let Err(err) = self.dispatch(session, message).await {
            debug!(
                session = session.id(),
                command = message.command(),
                problem = err.kind(),
                "request failed"
            );
            session.reply(&err.to_reply(message.arg("LABEL")));
        }
    }

    pub async fn dispatch(&self, session: &mut Session, message: &Message) -> Result<(), UserError> {
        let command = Command::from_name(message.command())
            .ok_or_else(|| UserError::UnknownCommand(message.command().to_string()))?;

        if session.account().is_none() && !command.allowed_before_login() {
            return Err(UserError::NotLoggedIn(command.name()));
        }

        let request = Request { command, message };
        match command {
            Command::Help => self.help(session, &request),
            Command::Login => self.login(session, &request).await,
            Command::Ping => self.ping(session, &request),
            Command::Privmsg => self.privmsg(session, &request).await,
            Command::Chanmsg => self.chanmsg(session, &request).await,
        }
    }

    fn help(&self, session: &Session, request: &Request<'_>) -> Result<(), UserError> {
        let names = Command::ALL.map(Command::name).join(",");
        session.reply(&request.reply("HELP").with("COMMANDS", names));
        Ok(())
    }

    fn ping(&self, session: &Session, request: &Request<'_>) -> Result<(), UserError> {
        let cookie = request.require("COOKIE")?;
        session.reply(&request.reply("PONG").with("COOKIE", cookie));
        Ok(())
    }

    async fn login(&self, session: &mut Session, request: &Request<'_>) -> Result<(), UserError> {
        if let Some(current) = session.account() {
            return Err(UserError::AlreadyLoggedIn(current.name().to_string()));
        }
        let username = request.require("USERNAME")?;
        let password = request.require("PASSWORD")?;

        let account = match self.directory.find_account(username) {
            Some(account) if account.verify_credential(password) => account,
            _ => {
                info!(session = session.id(), username, "login failed");
                return Err(UserError::LoginFailed);
            }
        };

        // Held across bind and burst so no other delivery can interleave.
        let mut state = account.lock().await;
        session.bind(Arc::clone(&account), &mut state)?;
        session.reply(
            &request
                .reply("LOGIN_GOOD")
                .with("USERNAME", account.name())
                .with("COMMENT", "Login is good."),
        );
        delivery::login_burst(&self.directory, &account, &mut state, session.handle());
        Ok(())
    }

    async fn privmsg(&self, session: &Session, request: &Request<'_>) -> Result<(), UserError> {
        let sender = session
            .account()
            .ok_or(UserError::NotLoggedIn(Command::Privmsg.name()))?;
        let target_name = request.require("TARGET")?;
        let text = request.require("MESSAGE")?;
        let target = self
            .directory
            .find_account(target_name)
            .ok_or_else(|| UserError::NonexistentTarget(target_name.to_string()))?;

        let outbound = chat_message("PRIVMSG", sender.name(), target_name, text, request);
        delivery::deliver_to_account(&target, &outbound, true).await?;

        // Echo to the sender's sessions so every client sees the conversation.
        if !Arc::ptr_eq(&target, sender) {
            if let Err(err) = delivery::deliver_to_account(sender, &outbound, false).await {
                debug!(session = session.id(), error = %err, "self-delivery skipped");
            }
        }
        Ok(())
    }

    async fn chanmsg(&self, session: &Session, request: &Request<'_>) -> Result<(), UserError> {
        let sender = session
            .account()
            .ok_or(UserError::NotLoggedIn(Command::Chanmsg.name()))?;
        let target_name = request.require("TARGET")?;
        let text = request.require("MESSAGE")?;
        let channel = self
            .directory
            .find_channel(target_name)
            .ok_or_else(|| UserError::NonexistentTarget(target_name.to_string()))?;

        let outbound = chat_message("CHANMSG", sender.name(), channel.name(), text, request);
        delivery::deliver_to_channel(&channel, &outbound).await;
        Ok(())
    }
}

struct Request<'a> {
    command: Command,
    message: &'a Message,
}

impl Request<'_> {
    fn require(&self, key: &'static str) -> Result<&str, UserError> {
        self.message.arg(key).ok_or(UserError::MissingArgument {
            command: self.command.name(),
            key,
        })
    }

    fn label(&self) -> Option<&str> {
        self.message.arg("LABEL")
    }

    /// A direct reply, carrying the request's label when it had one.
    fn reply(&self, command: &str) -> Message {
        Message::new(command).with_opt("LABEL", self.label())
    }
}

fn chat_message(
    command: &str,
    source: &str,
    target: &str,
    text: &str,
    request: &Request<'_>,
) -> Message {
    Message::new(command)
        .with("SOURCE", source)
        .with("TARGET", target)
        .with("MESSAGE", text)
        .with_opt("TYPE", request.message.arg("TYPE"))
        .with("TS", timestamp())
}

fn timestamp() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:06}", now.as_secs(), now.subsec_micros())
}
