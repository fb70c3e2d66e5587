//!
//! ## Configuration for spamd-client
//!
//! The `Config` struct carries the endpoint identity (network kind and
//! address) together with the mutable client policy: compression, TLS,
//! raw-body capture, and the connect/command timing knobs.
//!

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::error::SpamdError;

/// Socket spamd listens on when neither network nor address is given.
pub const DEFAULT_SOCKET: &str = "/var/run/spamassassin/spamd.sock";

/// Largest root CA file the client is willing to read.
pub const MAX_CERT_SIZE: u64 = 6000;

/// Network kinds a spamd endpoint can be reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Unix,
    UnixPacket,
    Tcp,
    Tcp4,
    Tcp6,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Unix => "unix",
            Network::UnixPacket => "unixpacket",
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
        }
    }

    pub fn is_unix(self) -> bool {
        matches!(self, Network::Unix | Network::UnixPacket)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = SpamdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unix" => Ok(Network::Unix),
            "unixpacket" => Ok(Network::UnixPacket),
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            other => Err(SpamdError::Config(format!(
                "Protocol: {other} is not supported"
            ))),
        }
    }
}

/// Configuration for a spamd client
#[derive(TypedBuilder, Debug, Clone, PartialEq)]
pub struct Config {
    /// Network kind the address is dialed over
    #[builder(default)]
    pub network: Network,

    /// Endpoint address: a socket path for unix kinds, `host:port` for tcp
    #[builder(default = DEFAULT_SOCKET.to_string(), setter(into))]
    pub address: String,

    /// User to impersonate on the server (`User:` header)
    #[builder(default, setter(strip_option, into))]
    pub user: Option<String>,

    /// Compress the message body with zlib
    #[builder(default = false)]
    pub use_compression: bool,

    /// Wrap tcp connections in TLS
    #[builder(default = false)]
    pub use_tls: bool,

    /// Skip verification of the server certificate
    #[builder(default = false)]
    pub insecure_skip_verify: bool,

    /// Optional PEM file the TLS certificate pool is populated from
    #[builder(default, setter(strip_option, into))]
    pub root_ca: Option<PathBuf>,

    /// Preserve the reply body bytes verbatim in addition to parsing them
    #[builder(default = false)]
    pub return_raw_body: bool,

    /// Deadline for a single connection attempt
    #[builder(default = Config::default_connect_timeout())]
    pub connect_timeout: Duration,

    /// Number of times a timed-out connect is retried
    #[builder(default = 0)]
    pub connect_retries: u32,

    /// Pause between connect retries
    #[builder(default = Config::default_connect_sleep())]
    pub connect_sleep: Duration,

    /// Wall-clock deadline covering the whole request/response exchange.
    /// Zero disables the deadline.
    #[builder(default = Config::default_command_timeout())]
    pub command_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config::builder().build()
    }
}

impl Config {
    fn default_connect_timeout() -> Duration {
        Duration::from_secs(15)
    }

    fn default_connect_sleep() -> Duration {
        Duration::from_secs(1)
    }

    fn default_command_timeout() -> Duration {
        Duration::from_secs(60)
    }

    /// Build a validated config from the classic constructor arguments.
    /// Empty network and address select the default unix socket.
    pub fn for_endpoint(
        network: &str,
        address: &str,
        user: &str,
        use_compression: bool,
    ) -> Result<Config, SpamdError> {
        let (network, address) = if network.is_empty() && address.is_empty() {
            (Network::Unix, DEFAULT_SOCKET.to_string())
        } else {
            (network.parse()?, address.to_string())
        };

        let mut config = Config::builder()
            .network(network)
            .address(address)
            .use_compression(use_compression)
            .build();
        if !user.is_empty() {
            config.user = Some(user.to_string());
        }
        config.validate()?;
        Ok(config)
    }

    /// Check the endpoint invariants: unix sockets must exist, a configured
    /// root CA must be readable and small enough.
    pub fn validate(&self) -> Result<(), SpamdError> {
        if self.network.is_unix() && !Path::new(&self.address).exists() {
            return Err(SpamdError::Config(format!(
                "The unix socket: {} does not exist",
                self.address
            )));
        }
        if let Some(path) = &self.root_ca {
            check_root_ca(path)?;
        }
        Ok(())
    }

    pub fn set_user(&mut self, user: impl Into<String>) {
        self.user = Some(user.into());
    }

    pub fn enable_compression(&mut self) {
        self.use_compression = true;
    }

    pub fn disable_compression(&mut self) {
        self.use_compression = false;
    }

    pub fn enable_tls(&mut self) {
        self.use_tls = true;
    }

    pub fn disable_tls(&mut self) {
        self.use_tls = false;
    }

    pub fn enable_raw_body(&mut self) {
        self.return_raw_body = true;
    }

    pub fn disable_raw_body(&mut self) {
        self.return_raw_body = false;
    }

    pub fn enable_tls_verification(&mut self) {
        self.insecure_skip_verify = false;
    }

    pub fn disable_tls_verification(&mut self) {
        self.insecure_skip_verify = true;
    }

    /// Set the path to the root CA PEM file, validating it up front.
    pub fn set_root_ca(&mut self, path: impl Into<PathBuf>) -> Result<(), SpamdError> {
        let path = path.into();
        check_root_ca(&path)?;
        self.root_ca = Some(path);
        Ok(())
    }

    pub fn set_connect_timeout(&mut self, timeout: Duration) {
        self.connect_timeout = timeout;
    }

    pub fn set_command_timeout(&mut self, timeout: Duration) {
        self.command_timeout = timeout;
    }

    /// Negative values are coerced to zero.
    pub fn set_connect_retries(&mut self, retries: i64) {
        self.connect_retries = retries.max(0) as u32;
    }

    pub fn set_connect_sleep(&mut self, sleep: Duration) {
        self.connect_sleep = sleep;
    }
}

fn check_root_ca(path: &Path) -> Result<(), SpamdError> {
    let meta = std::fs::metadata(path)?;
    if meta.len() > MAX_CERT_SIZE {
        return Err(SpamdError::Config(format!(
            "The RootCA file: {} is larger than max allowed: {}",
            path.display(),
            MAX_CERT_SIZE
        )));
    }
    Ok(())
}
