use crate::irc::Message;

pub fn join(channel: &str) -> Message { Message::new("JOIN").with_param(format!("#{}", channel)) }

pub fn part(channel: &str) -> Message { Message::new("PART").with_param(format!("#{}", channel)) }

pub fn privmsg(channel: &str, message: &str) -> Message {
    Message::new("PRIVMSG")
        .with_param(format!("#{}", channel))
        .with_trailing(message)
}

pub fn cap(capabilities: &[impl AsRef<str>]) -> Message {
    let which = capabilities.iter().map(|c| c.as_ref()).collect::<Vec<&str>>().join(" ");
    Message::new("CAP").with_param("REQ").with_trailing(which)
}

pub fn pass(token: &str) -> Message { Message::new("PASS").with_param(token) }

pub fn nick(login: &str) -> Message { Message::new("NICK").with_param(login) }

pub fn ping(payload: &str) -> Message { Message::new("PING").with_trailing(payload) }

/// Echoes the payload of `ping`, wherever it was carried
pub fn pong(ping: &Message) -> Message {
    Message {
        params: ping.params.clone(),
        trailing: ping.trailing.clone(),
        ..Message::new("PONG")
    }
}
