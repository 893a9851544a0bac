use anyhow::Result;
use twitch::{irc::Command, Client, Latch, Message, Session};

mod config;
use config::Config;

fn init_logger() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    Ok(pretty_env_logger::try_init()?)
}

fn log_chat(_: &Session, message: &Message) -> Result<()> {
    if message.command_kind() == Command::Privmsg {
        log::info!(
            "{} {}: {}",
            message.first_arg().unwrap_or_default(),
            message.nick().unwrap_or_default(),
            message.trailing.as_deref().unwrap_or_default()
        );
    }
    Ok(())
}

fn config_path() -> Result<String> {
    match std::env::args().nth(1) {
        Some(path) => Ok(path),
        None => Ok(format!("{}/Config.toml", std::env::var("CARGO_MANIFEST_DIR")?)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logger()?;
    let config = Config::init(&config_path()?);

    let shutdown = Latch::new();
    let mut client = Client::connect(config.twitch(), shutdown.clone()).await?;
    client.register_callback(log_chat);

    let session = client.session();
    for channel in &config.channels {
        session.join(channel)?;
    }

    tokio::spawn({
        let session = session.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    log::info!("Shutting down");
                    session.shutdown();
                }
                Err(err) => log::error!("Failed to listen for ctrl-c: {}", err),
            }
        }
    });

    client.run().await?;
    Ok(())
}
