//! Twitch chat (TMI) client
//!
//! * [`irc`](./irc) - parsing/serializing raw IRC messages, with
//!   Twitch-specific extensions (not RFC2812 compliant)
//! * [`tmi`](./tmi) - Twitch constants and command builders (PRIVMSG, JOIN,
//!   PING, etc.)
//! * [`conn`](./conn) - line-oriented transport over a TCP stream
//! * [`client`](./client) - the session engine: login, readiness gating,
//!   concurrent read/write/dispatch
//! * [`callback`](./callback) - message callbacks and the built-in protocol
//!   handlers

pub mod callback;
pub mod client;
pub mod conn;
pub mod irc;
pub mod tmi;

pub use callback::Callback;
pub use client::{Client, Latch, Session, State};
pub use conn::{Config, Error, Login, Result};
pub use irc::Message;
