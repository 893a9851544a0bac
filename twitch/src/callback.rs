//! Message callbacks and the built-in protocol handlers
use crate::{
    client::Session,
    irc::{Command, Message},
    tmi,
};

/// Receives every message of a session, in arrival order.
///
/// An `Err` is logged by the dispatcher and doesn't affect the other
/// callbacks or later messages.
pub trait Callback: Send + Sync + 'static {
    fn call(&self, session: &Session, message: &Message) -> anyhow::Result<()>;
}

impl<F> Callback for F
where
    F: Fn(&Session, &Message) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn call(&self, session: &Session, message: &Message) -> anyhow::Result<()> { self(session, message) }
}

/// Answers `PING <payload>` with `PONG <payload>`, even before login
/// completes.
pub fn keepalive_responder(session: &Session, message: &Message) -> anyhow::Result<()> {
    if message.command_kind() == Command::Ping {
        session.send_privileged(&tmi::write::pong(message).to_wire())?;
    }
    Ok(())
}

/// Opens the readiness gate on the end of the welcome banner.
pub fn login_completion_tracker(session: &Session, message: &Message) -> anyhow::Result<()> {
    if tmi::is_end_of_welcome(message) && session.mark_ready() {
        log::info!("Logged in");
    }
    Ok(())
}

pub fn keepalive_reply_tracker(session: &Session, message: &Message) -> anyhow::Result<()> {
    if tmi::is_keepalive_reply(message) {
        session.record_keepalive_reply();
    }
    Ok(())
}

pub fn reconnect_notice(_: &Session, message: &Message) -> anyhow::Result<()> {
    if message.command_kind() == Command::Reconnect {
        log::warn!("Server requested a reconnect; the session will end when it disconnects");
    }
    Ok(())
}
