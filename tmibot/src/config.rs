use std::{
    fmt::{self, Display, Formatter},
    time::Duration,
};

#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
pub struct Credentials {
    pub twitch_login: Option<String>,
    pub twitch_token: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub channels: Vec<String>,
    pub capabilities: Vec<String>,
    pub ping_interval: Option<u64>,
    pub ping_timeout: u64,
    pub credentials: Option<Credentials>,
}

#[derive(Clone, serde::Deserialize)]
struct PartialConfig {
    host: Option<String>,
    port: Option<u16>,
    channels: Option<Vec<String>>,
    capabilities: Option<Vec<String>>,
    ping_interval: Option<u64>,
    ping_timeout: Option<u64>,
    credentials: Option<Credentials>,
}

impl Config {
    pub fn init(path: &str) -> Config {
        log::debug!("Loading config from file '{}'", path);
        let cfg = match std::fs::read_to_string(path) {
            Ok(v) => v,
            Err(err) => {
                log::warn!("Failed to read config: {}; Falling back to defaults", err);
                String::new()
            }
        };
        let cfg = Config::parse(&cfg);
        log::info!("Using config: {}", cfg);
        cfg
    }

    pub fn parse(cfg: &str) -> Config {
        match toml::from_str::<PartialConfig>(cfg) {
            Ok(value) => value.into(),
            Err(err) => {
                log::warn!("Error while reading config: {}; Falling back to defaults", err);
                Config::default()
            }
        }
    }

    pub fn twitch(&self) -> twitch::Config {
        let defaults = twitch::Config::default();
        twitch::Config {
            host: self.host.clone(),
            port: self.port,
            credentials: match &self.credentials {
                Some(Credentials {
                    twitch_login: Some(login),
                    twitch_token: Some(token),
                }) => twitch::Login::Regular {
                    login: login.clone(),
                    token: token.clone(),
                },
                _ => twitch::Login::Anonymous,
            },
            capabilities: self.capabilities.clone(),
            ping_interval: self.ping_interval.map(Duration::from_secs),
            ping_timeout: Duration::from_secs(self.ping_timeout),
            ..defaults
        }
    }
}

fn default_capabilities() -> Vec<String> {
    vec![
        twitch::tmi::CAPABILITY_COMMANDS.into(),
        twitch::tmi::CAPABILITY_TAGS.into(),
    ]
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: twitch::conn::TMI_URL_HOST.into(),
            port: twitch::conn::TMI_PORT,
            channels: Vec::new(),
            capabilities: default_capabilities(),
            ping_interval: Some(60),
            ping_timeout: 10,
            credentials: None,
        }
    }
}

impl From<PartialConfig> for Config {
    fn from(cfg: PartialConfig) -> Config {
        let defaults = Config::default();
        Config {
            host: cfg.host.unwrap_or(defaults.host),
            port: cfg.port.unwrap_or(defaults.port),
            channels: cfg.channels.unwrap_or_default(),
            capabilities: cfg.capabilities.unwrap_or(defaults.capabilities),
            // 0 turns keepalive probing off
            ping_interval: match cfg.ping_interval {
                Some(0) => None,
                Some(secs) => Some(secs),
                None => defaults.ping_interval,
            },
            ping_timeout: cfg.ping_timeout.unwrap_or(defaults.ping_timeout),
            credentials: cfg.credentials,
        }
    }
}

impl Display for Config {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "Config {{")?;
        writeln!(f, "\thost = '{}',", self.host)?;
        writeln!(f, "\tport = {},", self.port)?;
        writeln!(f, "\tchannels = {:?},", self.channels)?;
        writeln!(f, "\tcapabilities = {:?},", self.capabilities)?;
        writeln!(f, "\tping_interval = {:?},", self.ping_interval)?;
        writeln!(f, "\tping_timeout = {},", self.ping_timeout)?;
        writeln!(f, "\tcredentials = ...,")?;
        write!(f, "}}")
    }
}
