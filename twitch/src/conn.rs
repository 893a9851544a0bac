//! TMI connection utility
//!
//! * [`Reader`] - turns the read half of a byte stream into a lazy sequence of
//!   CRLF-terminated lines
//! * [`Writer`] - writes complete lines to the write half
//! * [`Connection`] - owns both halves, closes the stream exactly once
use std::{future::Future, time::Duration};

use futures::Stream;
use thiserror::Error;
use tokio::{
    io::{split, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf},
    net::TcpStream,
};

use crate::{client::Latch, irc, tmi};

pub const TMI_URL_HOST: &str = "irc.chat.twitch.tv";
pub const TMI_PORT: u16 = 6667;

/// Tags may take up to 8 KiB, the rest of the line up to 512 bytes.
pub const MAX_LINE_LENGTH: usize = 8192 + 512;

/// Twitch accepts any password for `justinfan` logins.
const ANONYMOUS_PASS: &str = "SCHMOOPIIE";

#[derive(Clone, Debug, PartialEq)]
pub enum Login {
    Anonymous,
    Regular { login: String, token: String },
}

impl Default for Login {
    fn default() -> Self { Login::Anonymous }
}

impl Login {
    /// The `PASS` and `NICK` lines, in the order they have to be sent.
    pub fn lines(&self) -> [irc::Message; 2] {
        match self {
            Login::Anonymous => {
                use rand::Rng;
                let nick = format!("justinfan{}", rand::thread_rng().gen_range(10000..99999));
                [tmi::write::pass(ANONYMOUS_PASS), tmi::write::nick(&nick)]
            }
            Login::Regular { login, token } => {
                let token = if token.starts_with("oauth:") {
                    token.clone()
                } else {
                    format!("oauth:{}", token)
                };
                [tmi::write::pass(&token), tmi::write::nick(login)]
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub credentials: Login,
    /// Requested with a single `CAP REQ` once the session is ready
    pub capabilities: Vec<String>,
    pub connect_timeout: Duration,
    /// Proactive `PING` interval; no keepalive probing when `None`
    pub ping_interval: Option<Duration>,
    pub ping_timeout: Duration,
    pub queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: TMI_URL_HOST.into(),
            port: TMI_PORT,
            credentials: Login::default(),
            capabilities: Vec::new(),
            connect_timeout: Duration::from_secs(5),
            ping_interval: None,
            ping_timeout: Duration::from_secs(10),
            queue_capacity: 8192,
        }
    }
}

#[allow(clippy::upper_case_acronyms)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection to Twitch IRC server failed: {0}")]
    ConnectionFailed(#[source] std::io::Error),
    #[error("Encountered an I/O error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Encountered an error while parsing: {0}")]
    Parse(#[from] irc::Error),
    #[error("Timed out")]
    Timeout,
    #[error("Cancelled")]
    Cancelled,
    #[error("Stream closed")]
    StreamClosed,
    #[error("Stream closed in the middle of a line")]
    PartialLine,
    #[error("Line exceeds {} bytes", MAX_LINE_LENGTH)]
    LineTooLong,
    #[error("Outbound queue is full")]
    QueueFull,
    #[error("Session is closed")]
    SessionClosed,
    #[error("Session task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Opens a TCP connection to `config.host:config.port`.
///
/// Gives up with `Error::Cancelled` as soon as `cancel` is set.
pub async fn connect(config: &Config, cancel: &Latch) -> Result<TcpStream> {
    log::info!("Connecting to {}:{}", config.host, config.port);
    let attempt = async {
        match tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect((config.host.as_str(), config.port)),
        )
        .await
        {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(err)) => Err(Error::ConnectionFailed(err)),
            Err(_) => Err(Error::Timeout),
        }
    };
    cancellable(cancel, attempt).await
}

async fn cancellable<T>(cancel: &Latch, task: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.wait() => Err(Error::Cancelled),
        result = task => result,
    }
}

pub struct Reader<R> {
    stream: BufReader<R>,
    buffer: Vec<u8>,
}

impl<R: AsyncRead + Unpin> Reader<R> {
    pub fn new(read: R) -> Reader<R> {
        Reader {
            stream: BufReader::new(read),
            buffer: Vec::new(),
        }
    }

    /// Reads one line, terminator included, of at most `MAX_LINE_LENGTH`
    /// bytes.
    ///
    /// Cancel safe: bytes of an interrupted read stay buffered for the next
    /// call.
    pub async fn read_line(&mut self) -> Result<Vec<u8>> {
        let limit = MAX_LINE_LENGTH.saturating_sub(self.buffer.len()) as u64;
        (&mut self.stream).take(limit).read_until(b'\n', &mut self.buffer).await?;
        if self.buffer.ends_with(b"\n") {
            return Ok(std::mem::take(&mut self.buffer));
        }
        if self.buffer.len() >= MAX_LINE_LENGTH {
            self.buffer.clear();
            return Err(Error::LineTooLong);
        }
        if self.buffer.is_empty() {
            Err(Error::StreamClosed)
        } else {
            self.buffer.clear();
            Err(Error::PartialLine)
        }
    }

    /// Lazy sequence of lines. Ends after yielding the error that stopped
    /// the underlying stream.
    pub fn lines(&mut self) -> impl Stream<Item = Result<Vec<u8>>> + '_ {
        futures::stream::unfold(Some(self), |reader| async move {
            let reader = reader?;
            match reader.read_line().await {
                Ok(line) => Some((Ok(line), Some(reader))),
                Err(err) => Some((Err(err), None)),
            }
        })
    }

    pub fn into_inner(self) -> R { self.stream.into_inner() }
}

pub struct Writer<W> {
    stream: W,
}

impl<W: AsyncWrite + Unpin> Writer<W> {
    pub fn new(write: W) -> Writer<W> { Writer { stream: write } }

    /// Writes `line` in a single call, appending CRLF if it isn't there yet.
    pub async fn write_line(&mut self, line: &[u8]) -> Result<()> {
        if line.ends_with(irc::CRLF.as_bytes()) {
            self.stream.write_all(line).await?;
        } else {
            let mut buf = Vec::with_capacity(line.len() + 2);
            buf.extend_from_slice(line);
            buf.extend_from_slice(irc::CRLF.as_bytes());
            self.stream.write_all(&buf).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W { self.stream }
}

/// A duplex byte stream split into line-oriented halves.
pub struct Connection<S> {
    pub reader: Reader<ReadHalf<S>>,
    pub writer: Writer<WriteHalf<S>>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    pub fn new(stream: S) -> Connection<S> {
        let (read, write) = split(stream);
        Connection {
            reader: Reader::new(read),
            writer: Writer::new(write),
        }
    }

    /// Reunites the halves and shuts the stream down. Consumes the
    /// connection, so it can only happen once.
    pub async fn close(self) -> Result<()> {
        let mut stream = self.reader.into_inner().unsplit(self.writer.into_inner());
        stream.shutdown().await?;
        log::info!("Connection closed");
        Ok(())
    }
}
