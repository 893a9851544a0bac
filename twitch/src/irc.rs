use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;

use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;

pub const CRLF: &str = "\r\n";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Missing command")]
    MissingCommand,
    #[error("Line is not terminated by CRLF")]
    MissingTerminator,
}

pub type Result<T> = std::result::Result<T, Error>;

/// A single IRC line, with Twitch's tags extension.
///
/// Not RFC2812 compliant: the first `:` after the command always starts the
/// trailing segment, so a middle param can never contain a `:`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Message {
    pub tags: Option<Tags>,
    pub prefix: Option<Prefix>,
    pub command: String,
    pub params: Vec<String>,
    pub trailing: Option<String>,
}

/// Splits `data` at the first space.
fn split_token(data: &str) -> (&str, Option<&str>) {
    match data.split_once(' ') {
        Some((token, rest)) => (token, Some(rest)),
        None => (data, None),
    }
}

/// Splits at the first `:` that starts a token
fn split_trailing(rest: &str) -> Option<(&str, &str)> {
    match rest.strip_prefix(':') {
        Some(trailing) => Some(("", trailing)),
        None => rest.split_once(" :"),
    }
}

fn strip_terminator(data: &str) -> Result<&str> { data.strip_suffix(CRLF).ok_or(Error::MissingTerminator) }

impl Message {
    pub fn new(command: impl Into<String>) -> Message {
        Message {
            command: command.into(),
            ..Message::default()
        }
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Message {
        self.params.push(param.into());
        self
    }

    pub fn with_trailing(mut self, trailing: impl Into<String>) -> Message {
        self.trailing = Some(trailing.into());
        self
    }

    /// Parse a raw IRC line, including its CRLF terminator.
    ///
    /// `[@tags ][:prefix ]command[ params][ :trailing]\r\n`
    pub fn parse(source: &str) -> Result<Message> {
        let mut remainder = source;

        let tags = match remainder.strip_prefix('@') {
            Some(tagged) => {
                let (segment, rest) = split_token(tagged);
                remainder = rest.ok_or(Error::MissingCommand)?;
                Some(Tags::parse(segment))
            }
            None => None,
        };

        let prefix = match remainder.strip_prefix(':') {
            Some(prefixed) => {
                let (segment, rest) = split_token(prefixed);
                remainder = rest.ok_or(Error::MissingCommand)?;
                Some(Prefix::parse(segment))
            }
            None => None,
        };

        let (command, rest) = split_token(remainder);
        let rest = match rest {
            Some(rest) => rest,
            None => {
                // command-only line
                let command = strip_terminator(command)?;
                if command.is_empty() {
                    return Err(Error::MissingCommand);
                }
                return Ok(Message {
                    tags,
                    prefix,
                    command: command.into(),
                    params: Vec::new(),
                    trailing: None,
                });
            }
        };
        if command.is_empty() {
            return Err(Error::MissingCommand);
        }

        let (middle, trailing) = match split_trailing(rest) {
            Some((middle, trailing)) => (middle, Some(strip_terminator(trailing)?)),
            None => (strip_terminator(rest)?, None),
        };

        Ok(Message {
            tags,
            prefix,
            command: command.into(),
            params: middle
                .split(' ')
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect(),
            trailing: trailing.map(String::from),
        })
    }

    /// Serialized form, terminated by CRLF
    pub fn to_wire(&self) -> String { format!("{}{}", self, CRLF) }

    pub fn command_kind(&self) -> Command<'_> { Command::parse(&self.command) }

    pub fn nick(&self) -> Option<&str> { self.prefix.as_ref().map(|p| p.nick.as_str()) }

    /// First middle param, falling back to the trailing segment
    pub fn first_arg(&self) -> Option<&str> {
        self.params
            .first()
            .map(String::as_str)
            .or_else(|| self.trailing.as_deref())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(tags) = &self.tags {
            write!(f, "{} ", tags)?;
        }
        if let Some(prefix) = &self.prefix {
            write!(f, "{} ", prefix)?;
        }
        f.write_str(&self.command)?;
        for param in &self.params {
            write!(f, " {}", param)?;
        }
        if let Some(trailing) = &self.trailing {
            write!(f, " :{}", trailing)?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Command<'a> {
    Ping,
    Pong,
    /// Submit IRC password
    Pass,
    /// Change IRC nickname
    Nick,
    /// Join channel
    Join,
    /// Leave channel
    Part,
    /// Twitch Private Message
    Privmsg,
    /// RPL_WELCOME, first line after a successful PASS/NICK
    Welcome,
    /// RPL_ENDOFMOTD, last line of the welcome banner
    EndOfMotd,
    // Twitch extensions
    /// Send message to a single user
    Whisper,
    /// Purge a user's messages
    Clearchat,
    /// Single message removal
    Clearmsg,
    /// Sent upon successful authentication (PASS/NICK command)
    GlobalUserState,
    /// General notices from the server
    Notice,
    /// Server is about to restart and asks clients to reconnect
    Reconnect,
    /// Identifies the channel's chat settings
    RoomState,
    /// Announces Twitch-specific events to the channel
    UserNotice,
    /// Identifies a user's chat settings or properties
    UserState,
    /// Requesting an IRC capability
    Capability,
    /// Unknown command
    Unknown(&'a str),
}

impl<'a> Command<'a> {
    pub fn parse(cmd: &'a str) -> Command<'a> {
        use Command::*;
        match cmd {
            "PING" => Ping,
            "PONG" => Pong,
            "PASS" => Pass,
            "NICK" => Nick,
            "JOIN" => Join,
            "PART" => Part,
            "PRIVMSG" => Privmsg,
            "001" => Welcome,
            "376" => EndOfMotd,
            "WHISPER" => Whisper,
            "CLEARCHAT" => Clearchat,
            "CLEARMSG" => Clearmsg,
            "GLOBALUSERSTATE" => GlobalUserState,
            "NOTICE" => Notice,
            "RECONNECT" => Reconnect,
            "ROOMSTATE" => RoomState,
            "USERNOTICE" => UserNotice,
            "USERSTATE" => UserState,
            "CAP" => Capability,
            other => Unknown(other),
        }
    }

    pub fn as_str(&self) -> &'a str {
        use Command::*;
        match self {
            Ping => "PING",
            Pong => "PONG",
            Pass => "PASS",
            Nick => "NICK",
            Join => "JOIN",
            Part => "PART",
            Privmsg => "PRIVMSG",
            Welcome => "001",
            EndOfMotd => "376",
            Whisper => "WHISPER",
            Clearchat => "CLEARCHAT",
            Clearmsg => "CLEARMSG",
            GlobalUserState => "GLOBALUSERSTATE",
            Notice => "NOTICE",
            Reconnect => "RECONNECT",
            RoomState => "ROOMSTATE",
            UserNotice => "USERNOTICE",
            UserState => "USERSTATE",
            Capability => "CAP",
            Unknown(other) => other,
        }
    }
}

impl fmt::Display for Command<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Tags(HashMap<String, String>);

impl Deref for Tags {
    type Target = HashMap<String, String>;
    fn deref(&self) -> &Self::Target { &self.0 }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Tags {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Tags(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl Tags {
    /// Parses IRC tags in the form
    ///
    /// `key0=value0;key1=value1;...;keyN=valueN`
    ///
    /// (without the leading `@`). Pairs that don't split into exactly a key
    /// and a value are skipped.
    pub fn parse(data: &str) -> Tags {
        data.split(';')
            .filter_map(|pair| {
                let mut parts = pair.split('=');
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(key), Some(value), None) => Some((key, value)),
                    _ => None,
                }
            })
            .collect()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) { self.0.insert(key.into(), value.into()); }

    pub fn get(&self, key: &str) -> Option<&str> { self.0.get(key).map(String::as_str) }

    /// Parses a number
    pub fn get_number<N>(&self, key: &str) -> Option<N>
    where
        N: std::str::FromStr,
    {
        self.get(key).and_then(|v| v.parse::<N>().ok())
    }

    /// Parses a numeric bool (0 or 1)
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            "0" => Some(false),
            "1" => Some(true),
            _ => None,
        }
    }

    /// Parses a comma-separated list of values
    pub fn get_csv(&self, key: &str) -> Option<Vec<&str>> {
        self.get(key)
            .map(|v| v.split(',').filter(|v| !v.is_empty()).collect())
    }

    /// Parses a millisecond precision UNIX timestamp as a UTC date/time
    pub fn get_date(&self, key: &str) -> Option<DateTime<Utc>> {
        self.get_number::<i64>(key)
            .and_then(|v| Utc.timestamp_millis_opt(v).single())
    }
}

impl fmt::Display for Tags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut pairs = self.0.iter().collect::<Vec<_>>();
        pairs.sort();
        f.write_str("@")?;
        for (i, (key, value)) in pairs.into_iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Prefix {
    pub nick: String,
    pub user: Option<String>,
    pub host: Option<String>,
}

impl Prefix {
    /// Parses an IRC prefix (without the leading `:`) in one of the following
    /// forms:
    ///
    /// * `nick`
    /// * `nick!user`
    /// * `nick!user@host`
    ///
    /// Twitch sends its own hostname as a bare prefix, which lands in `nick`.
    pub fn parse(data: &str) -> Prefix {
        let non_empty = |s: &str| if s.is_empty() { None } else { Some(s.to_string()) };
        match data.split_once('!') {
            Some((nick, rest)) => {
                let (user, host) = match rest.split_once('@') {
                    Some((user, host)) => (user, Some(host)),
                    None => (rest, None),
                };
                Prefix {
                    nick: nick.into(),
                    user: non_empty(user),
                    host: host.and_then(non_empty),
                }
            }
            None => Prefix {
                nick: data.into(),
                user: None,
                host: None,
            },
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.nick)?;
        if let Some(user) = &self.user {
            write!(f, "!{}", user)?;
        }
        if let Some(host) = &self.host {
            write!(f, "@{}", host)?;
        }
        Ok(())
    }
}
