//! Twitch-specific constants and command builders
pub mod write;

use crate::irc::{Command, Message};

/// Hostname Twitch uses as the prefix of its own messages
pub const TMI_HOST: &str = "tmi.twitch.tv";

/// Capability to request membership state.
pub const CAPABILITY_MEMBERSHIP: &str = "twitch.tv/membership";
/// Capability to request tags.
pub const CAPABILITY_TAGS: &str = "twitch.tv/tags";
/// Capability to request commands.
pub const CAPABILITY_COMMANDS: &str = "twitch.tv/commands";

/// `:tmi.twitch.tv 376 <nick> :>` closes the welcome banner.
pub fn is_end_of_welcome(msg: &Message) -> bool {
    msg.command_kind() == Command::EndOfMotd && msg.nick() == Some(TMI_HOST)
}

/// `:tmi.twitch.tv PONG tmi.twitch.tv :tmi.twitch.tv`
pub fn is_keepalive_reply(msg: &Message) -> bool {
    msg.command_kind() == Command::Pong && msg.params.first().map(String::as_str) == Some(TMI_HOST)
}
