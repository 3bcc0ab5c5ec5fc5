use broker::{BrokerConfig, BROADCAST_CHANNEL, REPLY_CHANNEL};
use clap::builder::TypedValueParser as _;
use clap::Parser;
use dotenvy::dotenv;
use hub::{HubConfig, ReplyFallback};
use log::LevelFilter;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Secret used to verify access tokens when `JWT_SECRET` is not set. Only suitable
/// for local development.
pub const DEV_JWT_SECRET: &str = "dev-secret-key-change-in-production";

#[derive(Clone, Debug, PartialEq)]
pub enum RustEnv {
    Development,
    Production,
    Staging,
}

#[derive(Debug, PartialEq, Eq)]
pub struct RustEnvParseError;

impl FromStr for RustEnv {
    type Err = RustEnvParseError;
    fn from_str(level: &str) -> Result<RustEnv, Self::Err> {
        match level.to_lowercase().as_str() {
            "development" => Ok(RustEnv::Development),
            "production" => Ok(RustEnv::Production),
            "staging" => Ok(RustEnv::Staging),
            _ => Err(RustEnvParseError),
        }
    }
}

impl fmt::Display for RustEnv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RustEnv::Development => write!(f, "development"),
            RustEnv::Production => write!(f, "production"),
            RustEnv::Staging => write!(f, "staging"),
        }
    }
}

fn parse_reply_fallback(value: &str) -> ReplyFallback {
    match value.to_lowercase().as_str() {
        "drop" => ReplyFallback::Drop,
        _ => ReplyFallback::User,
    }
}

#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// A list of full CORS origin URLs that allowed to receive server responses.
    #[arg(
        long,
        env,
        value_delimiter = ',',
        use_value_delimiter = true,
        default_value = "http://localhost:3000,https://localhost:3000"
    )]
    pub allowed_origins: Vec<String>,

    /// The host interface to listen for incoming connections
    #[arg(short, long, env, default_value = "127.0.0.1")]
    pub interface: Option<String>,

    /// The host TCP port to listen for incoming connections
    #[arg(short, long, env, default_value_t = 4000)]
    pub port: u16,

    /// Set the log level verbosity threshold (level) to control what gets displayed on console output
    #[arg(
        short,
        long,
        env,
        default_value_t = LevelFilter::Info,
        value_parser = clap::builder::PossibleValuesParser::new(["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"])
            .map(|s| s.parse::<LevelFilter>().unwrap()),
        )]
    pub log_level_filter: LevelFilter,

    /// Set the Rust runtime environment to use.
    #[arg(
    short,
    long,
    env,
    default_value_t = RustEnv::Development,
    value_parser = clap::builder::PossibleValuesParser::new([
        "DEVELOPMENT", "PRODUCTION", "STAGING",
        "development", "production", "staging"
    ])
        .map(|s| s.parse::<RustEnv>().unwrap()),
    )]
    pub runtime_env: RustEnv,

    /// Shared secret for verifying HS256 access tokens presented on connect.
    #[arg(long, env, default_value = DEV_JWT_SECRET, hide_env_values = true)]
    jwt_secret: String,

    /// Seconds between sweeps of expired pending requests in the broker.
    #[arg(long, env, default_value_t = 30)]
    pub pending_sweep_interval_secs: u64,

    /// Seconds between sweeps of the hub's request route table.
    #[arg(long, env, default_value_t = 120)]
    pub route_sweep_interval_secs: u64,

    /// Seconds after which an unanswered request route is considered stale.
    #[arg(long, env, default_value_t = 120)]
    pub route_ttl_secs: u64,

    /// Route table size above which the sweep clears it entirely.
    #[arg(long, env, default_value_t = 10_000)]
    pub route_table_ceiling: usize,

    /// What to do with a reply whose originating connection is unknown: deliver it to
    /// all of the user's connections, or drop it.
    #[arg(
        long,
        env,
        default_value = "user",
        value_parser = clap::builder::PossibleValuesParser::new(["user", "drop", "USER", "DROP"])
            .map(|s| parse_reply_fallback(&s)),
    )]
    pub reply_fallback: ReplyFallback,

    /// Frames queued per connection before a slow client is disconnected.
    #[arg(long, env, default_value_t = 256)]
    pub outbound_buffer: usize,

    /// Broadcast a `userCount` event whenever a client connects or disconnects.
    #[arg(long, env, default_value_t = true, action = clap::ArgAction::Set)]
    pub announce_presence: bool,

    /// Channel on which worker replies travel back to the gateway.
    #[arg(long, env, default_value = REPLY_CHANNEL)]
    pub reply_channel: String,

    /// Channel on which worker events travel to connected clients.
    #[arg(long, env, default_value = BROADCAST_CHANNEL)]
    pub broadcast_channel: String,

    /// Seconds to wait for open connections to drain on shutdown.
    #[arg(long, env, default_value_t = 10)]
    pub shutdown_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        // Load .env file first
        dotenv().ok();
        // Then parse the command line parameters and flags
        Config::parse()
    }

    /// Parses an explicit argument list without touching `.env`. The first item is the
    /// program name.
    pub fn parse_from_args<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Config::try_parse_from(args)
    }

    pub fn jwt_secret(&self) -> &str {
        &self.jwt_secret
    }

    pub fn uses_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }

    pub fn runtime_env(&self) -> RustEnv {
        self.runtime_env.clone()
    }

    pub fn is_production(&self) -> bool {
        self.runtime_env() == RustEnv::Production
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            reply_channel: self.reply_channel.clone(),
            broadcast_channel: self.broadcast_channel.clone(),
            sweep_interval: Duration::from_secs(self.pending_sweep_interval_secs.max(1)),
        }
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            reply_fallback: self.reply_fallback,
            route_ttl: Duration::from_secs(self.route_ttl_secs),
            route_table_ceiling: self.route_table_ceiling,
            route_sweep_interval: Duration::from_secs(self.route_sweep_interval_secs.max(1)),
            outbound_buffer: self.outbound_buffer,
            announce_presence: self.announce_presence,
        }
    }
}
