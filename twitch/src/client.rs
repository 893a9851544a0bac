//! High-level Twitch chat client
//!
//! A [`Client`] owns one connection and drives it with independent tasks:
//! * read - turns incoming lines into [`Message`]s for the dispatcher
//! * write - drains the outbound queue onto the connection
//! * dispatch - hands every message to the registered callbacks, in order
//! * release - holds back regular sends until login has completed
//! * keepalive (optional) - probes the server with `PING`
//!
//! The session ends as soon as the read or the write task stops.
use std::{
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, TimeZone, Utc};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::{
        mpsc::{self, error::TrySendError},
        Notify,
    },
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_stream::{wrappers::ReceiverStream, StreamExt};

use crate::{
    callback::{self, Callback},
    conn::{self, Config, Connection, Error, Reader, Result, Writer},
    irc::{self, Message},
    tmi,
};

/// One-shot flag. Once set it stays set, and every task waiting on it wakes
/// up.
#[derive(Clone, Debug, Default)]
pub struct Latch {
    inner: Arc<LatchInner>,
}

#[derive(Debug, Default)]
struct LatchInner {
    set: AtomicBool,
    notify: Notify,
}

impl Latch {
    pub fn new() -> Latch { Latch::default() }

    /// Returns `true` only for the call that actually set the latch.
    pub fn set(&self) -> bool {
        let first = !self.inner.set.swap(true, Ordering::AcqRel);
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    pub fn is_set(&self) -> bool { self.inner.set.load(Ordering::Acquire) }

    pub async fn wait(&self) {
        loop {
            // registered before the check, so a concurrent `set` can't be missed
            let notified = self.inner.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Connecting = 0,
    Authenticating = 1,
    Ready = 2,
    Terminating = 3,
    Closed = 4,
}

impl State {
    fn from_u8(value: u8) -> State {
        match value {
            0 => State::Connecting,
            1 => State::Authenticating,
            2 => State::Ready,
            3 => State::Terminating,
            _ => State::Closed,
        }
    }

    fn can_advance_to(self, next: State) -> bool {
        use State::*;
        matches!(
            (self, next),
            (Connecting, Authenticating)
                | (Authenticating, Ready)
                | (Connecting | Authenticating | Ready, Terminating)
                | (Terminating, Closed)
        )
    }
}

const NO_KEEPALIVE_REPLY: i64 = i64::MIN;
const MIN_QUEUE_CAPACITY: usize = 16;
/// Upper bound on writing out what was queued before a shutdown
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

struct Shared {
    outbound: mpsc::Sender<String>,
    gated: mpsc::Sender<String>,
    login_sent: Latch,
    ready: Latch,
    shutdown: Latch,
    state: AtomicU8,
    /// Milliseconds since the epoch
    last_keepalive_reply: AtomicI64,
}

/// Handle to a live session. Cheap to clone; every clone talks to the same
/// connection.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

pub(crate) struct Queues {
    pub(crate) outbound: mpsc::Receiver<String>,
    pub(crate) gated: mpsc::Receiver<String>,
}

fn enqueue(queue: &mpsc::Sender<String>, line: &str) -> Result<()> {
    let mut line = line.to_string();
    if !line.ends_with(irc::CRLF) {
        line.push_str(irc::CRLF);
    }
    queue.try_send(line).map_err(|err| match err {
        TrySendError::Full(_) => Error::QueueFull,
        TrySendError::Closed(_) => Error::SessionClosed,
    })
}

impl Session {
    pub(crate) fn new(capacity: usize, shutdown: Latch) -> (Session, Queues) {
        let capacity = capacity.max(MIN_QUEUE_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (gated_tx, gated_rx) = mpsc::channel(capacity);
        let session = Session {
            shared: Arc::new(Shared {
                outbound: outbound_tx,
                gated: gated_tx,
                login_sent: Latch::new(),
                ready: Latch::new(),
                shutdown,
                state: AtomicU8::new(State::Connecting as u8),
                last_keepalive_reply: AtomicI64::new(NO_KEEPALIVE_REPLY),
            }),
        };
        let queues = Queues {
            outbound: outbound_rx,
            gated: gated_rx,
        };
        (session, queues)
    }

    /// Queues `message` behind the readiness gate.
    ///
    /// Never waits: the message is released, in call order, once login has
    /// completed.
    pub fn send(&self, message: &Message) -> Result<()> { self.send_raw(&message.to_wire()) }

    /// Like `.send()`, for an already serialized line.
    pub fn send_raw(&self, line: &str) -> Result<()> { enqueue(&self.shared.gated, line) }

    /// Queues `line` for writing right away, bypassing the readiness gate.
    /// Meant for login and keepalive traffic.
    pub fn send_privileged(&self, line: &str) -> Result<()> { enqueue(&self.shared.outbound, line) }

    pub fn join(&self, channel: &str) -> Result<()> { self.send(&tmi::write::join(channel)) }

    pub fn part(&self, channel: &str) -> Result<()> { self.send(&tmi::write::part(channel)) }

    pub fn privmsg(&self, channel: &str, message: &str) -> Result<()> {
        self.send(&tmi::write::privmsg(channel, message))
    }

    /// Asks the session to stop. Lines queued so far are still written.
    /// `Client::run` returns `Ok(())` afterwards unless the transport failed
    /// first.
    pub fn shutdown(&self) {
        if self.shared.shutdown.set() {
            log::info!("Shutdown requested");
        }
    }

    pub fn state(&self) -> State { State::from_u8(self.shared.state.load(Ordering::Acquire)) }

    pub fn is_ready(&self) -> bool { self.shared.ready.is_set() }

    pub async fn wait_ready(&self) { self.shared.ready.wait().await }

    pub fn last_keepalive_reply(&self) -> Option<DateTime<Utc>> {
        match self.shared.last_keepalive_reply.load(Ordering::Acquire) {
            NO_KEEPALIVE_REPLY => None,
            millis => Utc.timestamp_millis_opt(millis).single(),
        }
    }

    /// Opens the readiness gate. Returns `true` the first time only.
    pub(crate) fn mark_ready(&self) -> bool {
        if !self.shared.ready.set() {
            return false;
        }
        if !self.advance(State::Ready) {
            log::warn!("Login completed while the session was {:?}", self.state());
        }
        true
    }

    pub(crate) fn record_keepalive_reply(&self) {
        self.shared
            .last_keepalive_reply
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    pub(crate) fn advance(&self, next: State) -> bool {
        let mut current = self.state();
        loop {
            if !current.can_advance_to(next) {
                return false;
            }
            match self.shared.state.compare_exchange(
                current as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    log::debug!("Session {:?} -> {:?}", current, next);
                    return true;
                }
                Err(actual) => current = State::from_u8(actual),
            }
        }
    }

    fn terminate(&self) {
        self.advance(State::Terminating);
        self.shared.shutdown.set();
    }
}

/// Never log the credential.
fn redact(line: &str) -> &str {
    if line.starts_with("PASS ") {
        "PASS ***"
    } else {
        line.trim_end()
    }
}

pub struct Client<S> {
    config: Config,
    conn: Connection<S>,
    session: Session,
    queues: Queues,
    callbacks: Vec<Box<dyn Callback>>,
}

impl Client<TcpStream> {
    /// Connects to `config.host:config.port` and queues the login.
    ///
    /// `shutdown` cancels the connection attempt, and later the session.
    pub async fn connect(config: Config, shutdown: Latch) -> Result<Client<TcpStream>> {
        let stream = conn::connect(&config, &shutdown).await?;
        log::info!("Connected to {}:{}", config.host, config.port);
        Client::with_shutdown(config, stream, shutdown)
    }
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps an already established stream.
    pub fn new(config: Config, stream: S) -> Result<Client<S>> { Client::with_shutdown(config, stream, Latch::new()) }

    fn with_shutdown(config: Config, stream: S, shutdown: Latch) -> Result<Client<S>> {
        let (session, queues) = Session::new(config.queue_capacity, shutdown);
        let mut client = Client {
            config,
            conn: Connection::new(stream),
            session,
            queues,
            callbacks: Vec::new(),
        };
        client.register_callback(callback::login_completion_tracker);
        client.register_callback(callback::keepalive_responder);
        client.register_callback(callback::keepalive_reply_tracker);
        client.register_callback(callback::reconnect_notice);
        client.bootstrap()?;
        Ok(client)
    }

    /// `PASS`, `NICK`, then the capability request behind the gate.
    fn bootstrap(&self) -> Result<()> {
        for line in self.config.credentials.lines() {
            self.session.send_privileged(&line.to_wire())?;
        }
        self.session.shared.login_sent.set();
        self.session.advance(State::Authenticating);
        if !self.config.capabilities.is_empty() {
            self.session.send(&tmi::write::cap(self.config.capabilities.as_slice()))?;
        }
        Ok(())
    }

    pub fn session(&self) -> Session { self.session.clone() }

    /// Callbacks run in registration order, after the built-in ones.
    pub fn register_callback(&mut self, callback: impl Callback) { self.callbacks.push(Box::new(callback)); }

    /// Drives the session until it ends.
    ///
    /// Returns the error that ended it: `Error::StreamClosed` when the server
    /// hung up, `Error::IO` on a transport failure, `Error::Timeout` when a
    /// `PING` went unanswered. `Ok(())` means `Session::shutdown` was called.
    pub async fn run(self) -> Result<()> {
        let Client {
            config,
            conn,
            session,
            queues,
            callbacks,
        } = self;
        let Connection { reader, writer } = conn;
        let (inbound_tx, inbound_rx) = mpsc::channel(config.queue_capacity.max(MIN_QUEUE_CAPACITY));

        let read_task = tokio::spawn(read_loop(reader, inbound_tx, session.clone()));
        let write_task = tokio::spawn(write_loop(writer, queues.outbound, session.clone()));
        let dispatch_task = tokio::spawn(dispatch_loop(inbound_rx, callbacks, session.clone()));
        let release_task = tokio::spawn(release_loop(queues.gated, session.clone()));
        let keepalive_task = config
            .ping_interval
            .map(|interval| tokio::spawn(keepalive_loop(session.clone(), interval, config.ping_timeout)));

        // either task stopping raises `shutdown`, which stops the other one
        let (read, write) = tokio::join!(read_task, write_task);
        session.terminate();

        join_quietly("dispatch", dispatch_task).await;
        join_quietly("release", release_task).await;
        let keepalive = match keepalive_task {
            Some(task) => task.await.unwrap_or(Ok(())),
            None => Ok(()),
        };

        let outcome = match (read, write) {
            (Ok((reader, read_outcome)), Ok((mut writer, outbound, write_outcome))) => {
                match outbound {
                    Some(outbound) if read_outcome.is_ok() && write_outcome.is_ok() => {
                        flush(&mut writer, outbound).await
                    }
                    _ => {}
                }
                if let Err(err) = (Connection { reader, writer }).close().await {
                    log::warn!("Failed to close connection: {}", err);
                }
                read_outcome.and(write_outcome)
            }
            (Err(err), _) | (_, Err(err)) => Err(Error::Join(err)),
        };
        session.advance(State::Closed);

        outcome.and(keepalive)
    }
}

async fn join_quietly(name: &str, task: JoinHandle<()>) {
    if let Err(err) = task.await {
        log::error!("{} task failed: {}", name, err);
    }
}

async fn read_loop<R>(mut reader: Reader<R>, inbound: mpsc::Sender<Message>, session: Session) -> (Reader<R>, Result<()>)
where
    R: AsyncRead + Unpin,
{
    let shutdown = session.shared.shutdown.clone();
    let outcome = {
        let lines = reader.lines();
        tokio::pin!(lines);
        loop {
            let line = tokio::select! {
                _ = shutdown.wait() => break Ok(()),
                line = lines.next() => line,
            };
            let line = match line {
                Some(Ok(line)) => line,
                Some(Err(Error::StreamClosed)) | None => {
                    log::info!("Connection closed by server");
                    break Err(Error::StreamClosed);
                }
                Some(Err(err)) => {
                    log::error!("Error reading from connection: {}", err);
                    break Err(err);
                }
            };
            let line = String::from_utf8_lossy(&line);
            log::trace!("> {}", line.trim_end());
            let message = match Message::parse(&line) {
                Ok(message) => message,
                Err(err) => {
                    log::warn!("Dropping malformed line {:?}: {}", line, err);
                    continue;
                }
            };
            tokio::select! {
                _ = shutdown.wait() => break Ok(()),
                sent = inbound.send(message) => if sent.is_err() {
                    break Ok(());
                },
            }
        }
    };
    session.terminate();
    (reader, outcome)
}

async fn write_loop<W>(
    mut writer: Writer<W>,
    mut outbound: mpsc::Receiver<String>,
    session: Session,
) -> (Writer<W>, Option<mpsc::Receiver<String>>, Result<()>)
where
    W: AsyncWrite + Unpin,
{
    let shutdown = session.shared.shutdown.clone();
    // a line cut off mid-write leaves nothing safe to flush after it
    let mut interrupted = false;
    let outcome = loop {
        let line = tokio::select! {
            _ = shutdown.wait() => break Ok(()),
            line = outbound.recv() => match line {
                Some(line) => line,
                None => break Ok(()),
            },
        };
        log::trace!("< {}", redact(&line));
        tokio::select! {
            biased;
            written = writer.write_line(line.as_bytes()) => if let Err(err) = written {
                log::error!("Error writing to connection: {}", err);
                break Err(err);
            },
            _ = shutdown.wait() => {
                interrupted = true;
                break Ok(());
            }
        }
    };
    session.terminate();
    let outbound = if interrupted { None } else { Some(outbound) };
    (writer, outbound, outcome)
}

/// Writes whatever is still queued after a shutdown, and closes the queue.
async fn flush<W>(writer: &mut Writer<W>, mut outbound: mpsc::Receiver<String>)
where
    W: AsyncWrite + Unpin,
{
    outbound.close();
    let remaining = async {
        while let Some(line) = outbound.recv().await {
            log::trace!("< {}", redact(&line));
            writer.write_line(line.as_bytes()).await?;
        }
        Ok::<_, Error>(())
    };
    match tokio::time::timeout(FLUSH_TIMEOUT, remaining).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => log::warn!("Failed to flush queued lines: {}", err),
        Err(_) => log::warn!("Timed out flushing queued lines"),
    }
}

/// Runs until the read task is gone, so messages read before a disconnect
/// still reach the callbacks.
async fn dispatch_loop(inbound: mpsc::Receiver<Message>, callbacks: Vec<Box<dyn Callback>>, session: Session) {
    let mut inbound = ReceiverStream::new(inbound);
    while let Some(message) = inbound.next().await {
        for callback in &callbacks {
            if let Err(err) = callback.call(&session, &message) {
                log::warn!("Error occurred and ignored in callback: {:#}", err);
            }
        }
    }
}

async fn release_loop(mut gated: mpsc::Receiver<String>, session: Session) {
    let shared = &session.shared;
    tokio::select! {
        _ = shared.shutdown.wait() => return,
        _ = async {
            shared.login_sent.wait().await;
            shared.ready.wait().await;
        } => {}
    }
    log::debug!("Login complete, releasing queued messages");
    loop {
        let line = tokio::select! {
            _ = shared.shutdown.wait() => break,
            line = gated.recv() => match line {
                Some(line) => line,
                None => return,
            },
        };
        let permit = tokio::select! {
            _ = shared.shutdown.wait() => {
                hand_over(&shared.outbound, line);
                break;
            }
            permit = shared.outbound.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };
        permit.send(line);
    }
    // released lines queued before the shutdown go out with the final flush
    while let Ok(line) = gated.try_recv() {
        if !hand_over(&shared.outbound, line) {
            break;
        }
    }
}

fn hand_over(outbound: &mpsc::Sender<String>, line: String) -> bool {
    match outbound.try_send(line) {
        Ok(()) => true,
        Err(err) => {
            log::warn!("Dropping queued line after shutdown: {}", err);
            false
        }
    }
}

async fn keepalive_loop(session: Session, interval: Duration, timeout: Duration) -> Result<()> {
    let shutdown = session.shared.shutdown.clone();
    tokio::select! {
        _ = shutdown.wait() => return Ok(()),
        _ = session.wait_ready() => {}
    }
    let ping = tmi::write::ping(tmi::TMI_HOST).to_wire();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.wait() => return Ok(()),
            _ = ticker.tick() => {}
        }
        let sent_at = Utc::now().timestamp_millis();
        if let Err(err) = session.send_privileged(&ping) {
            log::warn!("Failed to queue PING: {}", err);
            continue;
        }
        tokio::select! {
            _ = shutdown.wait() => return Ok(()),
            _ = tokio::time::sleep(timeout) => {}
        }
        match session.last_keepalive_reply() {
            Some(reply) if reply.timestamp_millis() >= sent_at => continue,
            _ => {
                log::warn!("No PONG received within {:?}, terminating session", timeout);
                session.terminate();
                return Err(Error::Timeout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn latch_wakes_waiters_once() {
        let latch = Latch::new();
        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.wait().await })
        };
        tokio::task::yield_now().await;
        assert!(!latch.is_set());
        assert!(latch.set());
        assert!(!latch.set());
        waiter.await.unwrap();
        // already set, returns immediately
        latch.wait().await;
    }

    #[test]
    fn state_transitions() {
        let (session, _queues) = Session::new(16, Latch::new());
        assert_eq!(State::Connecting, session.state());
        assert!(!session.advance(State::Ready));
        assert!(session.advance(State::Authenticating));
        assert!(!session.advance(State::Closed));
        assert!(session.advance(State::Ready));
        assert!(!session.advance(State::Authenticating));
        assert!(session.advance(State::Terminating));
        assert!(session.advance(State::Closed));
        assert!(!session.advance(State::Terminating));
        assert_eq!(State::Closed, session.state());
    }

    #[test]
    fn mark_ready_once() {
        let (session, _queues) = Session::new(16, Latch::new());
        session.advance(State::Authenticating);
        assert!(session.mark_ready());
        assert!(!session.mark_ready());
        assert!(session.is_ready());
        assert_eq!(State::Ready, session.state());
    }

    #[test]
    fn sends_are_terminated_and_queued_separately() {
        let (session, mut queues) = Session::new(16, Latch::new());
        session.send_privileged("PASS oauth:x").unwrap();
        session.join("channel").unwrap();
        assert_eq!(Ok("PASS oauth:x\r\n".to_string()), queues.outbound.try_recv());
        assert!(queues.outbound.try_recv().is_err());
        assert_eq!(Ok("JOIN #channel\r\n".to_string()), queues.gated.try_recv());
    }

    #[test]
    fn full_queue_does_not_block() {
        let (session, _queues) = Session::new(0, Latch::new());
        for _ in 0..MIN_QUEUE_CAPACITY {
            session.send_raw("PING").unwrap();
        }
        assert!(matches!(session.send_raw("PING"), Err(Error::QueueFull)));
    }

    #[test]
    fn closed_queue() {
        let (session, queues) = Session::new(16, Latch::new());
        drop(queues);
        assert!(matches!(session.send_privileged("PING"), Err(Error::SessionClosed)));
    }

    #[test]
    fn redacts_credentials() {
        assert_eq!("PASS ***", redact("PASS oauth:secret\r\n"));
        assert_eq!("NICK bot", redact("NICK bot\r\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_pings_wait_for_the_reply_window() {
        let (session, mut queues) = Session::new(16, Latch::new());
        session.advance(State::Authenticating);
        session.mark_ready();
        let timeout = Duration::from_millis(35);
        let task = tokio::spawn(keepalive_loop(session.clone(), Duration::from_millis(10), timeout));

        let mut sent = Vec::new();
        for _ in 0..4 {
            let line = queues.outbound.recv().await.unwrap();
            assert_eq!("PING :tmi.twitch.tv\r\n", line);
            sent.push(tokio::time::Instant::now());
            session.record_keepalive_reply();
        }
        for pair in sent.windows(2) {
            assert!(pair[1] - pair[0] >= timeout);
        }

        session.shutdown();
        assert!(task.await.unwrap().is_ok());
    }

    #[test]
    fn keepalive_reply_timestamp() {
        let (session, _queues) = Session::new(16, Latch::new());
        assert_eq!(None, session.last_keepalive_reply());
        session.record_keepalive_reply();
        assert!(session.last_keepalive_reply().is_some());
    }
}
