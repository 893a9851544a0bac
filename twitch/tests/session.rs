use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::{
    io::{split, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf},
    net::TcpListener,
    sync::mpsc,
    time::timeout,
};
use twitch::{tmi, Client, Config, Error, Latch, Login, Message, Session, State};

const TIMEOUT: Duration = Duration::from_secs(5);

struct Server<R, W> {
    lines: Lines<BufReader<R>>,
    write: W,
}

impl<R, W> Server<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn expect(&mut self, line: &str) {
        let got = timeout(TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for a line")
            .unwrap();
        assert_eq!(Some(line.to_string()), got);
    }

    async fn expect_silence(&mut self) {
        assert!(timeout(Duration::from_millis(200), self.lines.next_line())
            .await
            .is_err());
    }

    /// Reads until the client closes the connection.
    async fn expect_closed(&mut self) {
        loop {
            let line = timeout(TIMEOUT, self.lines.next_line())
                .await
                .expect("connection was not closed");
            match line {
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
    }

    async fn send(&mut self, data: &str) { self.write.write_all(data.as_bytes()).await.unwrap(); }
}

fn config() -> Config {
    Config {
        credentials: Login::Regular {
            login: "bot".into(),
            token: "token".into(),
        },
        ..Config::default()
    }
}

fn setup(config: Config) -> (Client<DuplexStream>, Server<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let client = Client::new(config, client_io).unwrap();
    let (read, write) = split(server_io);
    let server = Server {
        lines: BufReader::new(read).lines(),
        write,
    };
    (client, server)
}

#[tokio::test]
async fn login_then_gated_sends_in_order() {
    let (client, mut server) = setup(Config {
        capabilities: vec![tmi::CAPABILITY_TAGS.into(), tmi::CAPABILITY_COMMANDS.into()],
        ..config()
    });
    let session = client.session();
    assert_eq!(State::Authenticating, session.state());
    session.privmsg("channel", "first").unwrap();
    session.join("channel").unwrap();
    let run = tokio::spawn(client.run());

    server.expect("PASS oauth:token").await;
    server.expect("NICK bot").await;

    // keepalive is answered mid-handshake
    server.send("PING :tmi.twitch.tv\r\n").await;
    server.expect("PONG :tmi.twitch.tv").await;
    server.expect_silence().await;
    assert!(!session.is_ready());

    server
        .send(":tmi.twitch.tv 001 bot :Welcome, GLHF!\r\n:tmi.twitch.tv 376 bot :>\r\n")
        .await;
    server.expect("CAP REQ :twitch.tv/tags twitch.tv/commands").await;
    server.expect("PRIVMSG #channel :first").await;
    server.expect("JOIN #channel").await;
    assert!(session.is_ready());
    assert_eq!(State::Ready, session.state());

    // a repeated banner end changes nothing
    server.send(":tmi.twitch.tv 376 bot :>\r\n").await;
    session.privmsg("channel", "second").unwrap();
    server.expect("PRIVMSG #channel :second").await;
    assert_eq!(State::Ready, session.state());

    drop(server);
    let outcome = timeout(TIMEOUT, run).await.expect("run did not return").unwrap();
    assert!(matches!(outcome, Err(Error::StreamClosed)));
    assert_eq!(State::Closed, session.state());
    assert!(matches!(session.privmsg("channel", "late"), Err(Error::SessionClosed)));
}

#[tokio::test]
async fn callbacks_run_in_order_and_survive_failures() {
    let (mut client, mut server) = setup(config());
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.register_callback(|_: &Session, _: &Message| -> anyhow::Result<()> { anyhow::bail!("broken callback") });
    client.register_callback(move |_: &Session, msg: &Message| -> anyhow::Result<()> {
        tx.send(msg.clone())?;
        Ok(())
    });
    let session = client.session();
    let run = tokio::spawn(client.run());

    server.send("MALFORMED LINE\n").await;
    server
        .send(":a!a@a.tmi.twitch.tv PRIVMSG #c :one\r\n:b!b@b.tmi.twitch.tv PRIVMSG #c :two\r\n")
        .await;
    let first = timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    let second = timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(Some("one"), first.trailing.as_deref());
    assert_eq!(Some("a"), first.nick());
    assert_eq!(Some("two"), second.trailing.as_deref());

    session.shutdown();
    let outcome = timeout(TIMEOUT, run).await.expect("run did not return").unwrap();
    assert!(outcome.is_ok());
    assert_eq!(State::Closed, session.state());

    server.expect("PASS oauth:token").await;
    server.expect("NICK bot").await;
    server.expect_closed().await;
}

#[tokio::test]
async fn disconnect_during_handshake() {
    let (client, server) = setup(config());
    let session = client.session();
    session.privmsg("channel", "never sent").unwrap();
    drop(server);
    let outcome = timeout(TIMEOUT, client.run()).await.expect("run did not return");
    assert!(matches!(outcome, Err(Error::StreamClosed) | Err(Error::IO(_))));
    assert!(!session.is_ready());
    assert_eq!(State::Closed, session.state());
}

#[tokio::test]
async fn keepalive_reply_is_recorded() {
    let (client, mut server) = setup(Config {
        ping_interval: Some(Duration::from_millis(50)),
        ping_timeout: Duration::from_millis(500),
        ..config()
    });
    let session = client.session();
    let run = tokio::spawn(client.run());

    server.expect("PASS oauth:token").await;
    server.expect("NICK bot").await;
    server.send(":tmi.twitch.tv 376 bot :>\r\n").await;
    server.expect("PING :tmi.twitch.tv").await;
    server
        .send(":tmi.twitch.tv PONG tmi.twitch.tv :tmi.twitch.tv\r\n")
        .await;

    timeout(TIMEOUT, async {
        while session.last_keepalive_reply().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("PONG was not recorded");

    session.shutdown();
    let outcome = timeout(TIMEOUT, run).await.expect("run did not return").unwrap();
    assert!(outcome.is_ok());
}

#[tokio::test]
async fn unanswered_ping_ends_the_session() {
    let (client, mut server) = setup(Config {
        ping_interval: Some(Duration::from_millis(50)),
        ping_timeout: Duration::from_millis(100),
        ..config()
    });
    let session = client.session();
    let run = tokio::spawn(client.run());

    server.expect("PASS oauth:token").await;
    server.expect("NICK bot").await;
    server.send(":tmi.twitch.tv 376 bot :>\r\n").await;
    server.expect("PING :tmi.twitch.tv").await;

    let outcome = timeout(TIMEOUT, run).await.expect("run did not return").unwrap();
    assert!(matches!(outcome, Err(Error::Timeout)));
    assert_eq!(State::Closed, session.state());
}

#[tokio::test]
async fn connect_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = Config {
        host: "127.0.0.1".into(),
        port,
        ..config()
    };

    let (client, accepted) = tokio::join!(Client::connect(config, Latch::new()), listener.accept());
    let client = client.unwrap();
    let (stream, _) = accepted.unwrap();
    let (read, write) = stream.into_split();
    let mut server = Server {
        lines: BufReader::new(read).lines(),
        write,
    };

    let session = client.session();
    let run = tokio::spawn(client.run());
    server.expect("PASS oauth:token").await;
    server.expect("NICK bot").await;
    drop(server);

    let outcome = timeout(TIMEOUT, run).await.expect("run did not return").unwrap();
    assert!(matches!(outcome, Err(Error::StreamClosed) | Err(Error::IO(_))));
    assert_eq!(State::Closed, session.state());
}

#[tokio::test]
async fn lines_before_disconnect_reach_callbacks() {
    let (mut client, mut server) = setup(config());
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.register_callback(move |_: &Session, msg: &Message| -> anyhow::Result<()> {
        if msg.command == "NOTICE" {
            tx.send(msg.trailing.clone())?;
        }
        Ok(())
    });
    let run = tokio::spawn(client.run());

    server.expect("PASS oauth:token").await;
    server.expect("NICK bot").await;
    server
        .send(":tmi.twitch.tv NOTICE * :Login authentication failed\r\n")
        .await;
    drop(server);

    let outcome = timeout(TIMEOUT, run).await.expect("run did not return").unwrap();
    assert!(matches!(outcome, Err(Error::StreamClosed)));
    assert_eq!(Ok(Some("Login authentication failed".to_string())), rx.try_recv());
}

#[tokio::test]
async fn queued_lines_are_written_before_shutdown() {
    let (client, mut server) = setup(config());
    let session = client.session();
    let run = tokio::spawn(client.run());

    server.expect("PASS oauth:token").await;
    server.expect("NICK bot").await;
    server.send(":tmi.twitch.tv 376 bot :>\r\n").await;
    timeout(TIMEOUT, session.wait_ready()).await.expect("never became ready");

    session.privmsg("channel", "bye").unwrap();
    session.part("channel").unwrap();
    session.shutdown();

    server.expect("PRIVMSG #channel :bye").await;
    server.expect("PART #channel").await;
    server.expect_closed().await;
    let outcome = timeout(TIMEOUT, run).await.expect("run did not return").unwrap();
    assert!(outcome.is_ok());
    assert!(matches!(session.join("channel"), Err(Error::SessionClosed)));
}
