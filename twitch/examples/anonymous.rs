use twitch::{irc::Command, Client, Config, Latch, Message, Session};

#[tokio::main]
async fn main() -> twitch::Result<()> {
    let mut client = Client::connect(Config::default(), Latch::new()).await?;
    client.register_callback(|session: &Session, message: &Message| -> anyhow::Result<()> {
        if message.command_kind() == Command::Privmsg {
            let text = message.trailing.as_deref().unwrap_or_default();
            println!(
                "{} {}: {}",
                message.first_arg().unwrap_or_default(),
                message.nick().unwrap_or_default(),
                text
            );
            if text.starts_with("!stop") {
                session.shutdown();
            }
        }
        Ok(())
    });

    let session = client.session();
    session.join("moscowwbish")?;
    tokio::spawn({
        let session = session.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("CTRL-C");
                session.shutdown();
            }
        }
    });

    client.run().await
}
