use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tether_common::{Result, Size, TetherError};
use tether_core::{HubConfig, ShellConfig};

/// Command line and environment configuration for the server
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Remote terminal bridge and telemetry hub", long_about = None)]
pub struct ServerConfig {
    /// Address to listen on
    #[arg(long, env = "TETHER_BIND", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 8888)]
    pub port: u16,

    /// Shell launched for terminal sessions (falls back to /bin/bash)
    #[arg(long, env = "SHELL")]
    pub shell: Option<String>,

    /// Initial terminal rows
    #[arg(long, default_value_t = 24)]
    pub rows: u16,

    /// Initial terminal columns
    #[arg(long, default_value_t = 80)]
    pub cols: u16,

    /// Seconds between telemetry snapshots
    #[arg(long, default_value_t = 2)]
    pub telemetry_interval_secs: u64,

    /// Idle seconds before a telemetry client is pinged
    #[arg(long, default_value_t = 54)]
    pub keepalive_secs: u64,

    /// Seconds of silence after which a telemetry client is dropped
    #[arg(long, default_value_t = 60)]
    pub read_timeout_secs: u64,

    /// Upper bound in seconds for a single write to a telemetry client
    #[arg(long, default_value_t = 10)]
    pub write_timeout_secs: u64,

    /// Messages a telemetry client may have queued before drops start
    #[arg(long, default_value_t = 256)]
    pub queue_capacity: usize,

    /// Accepted access token (repeatable, comma separated in the environment)
    #[arg(long = "auth-token", env = "TETHER_AUTH_TOKEN", value_delimiter = ',', hide_env_values = true)]
    pub auth_tokens: Vec<String>,

    /// Allowed CORS origins; any origin when empty
    #[arg(long, env = "CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

impl ServerConfig {
    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if !self.initial_size().is_valid() {
            return Err(config_error(format!(
                "terminal size must be non-zero, got {}x{}",
                self.rows, self.cols
            )));
        }
        for (name, secs) in [
            ("telemetry interval", self.telemetry_interval_secs),
            ("keepalive interval", self.keepalive_secs),
            ("read timeout", self.read_timeout_secs),
            ("write timeout", self.write_timeout_secs),
        ] {
            if secs == 0 {
                return Err(config_error(format!("{} must be at least one second", name)));
            }
        }
        if self.keepalive_secs >= self.read_timeout_secs {
            return Err(config_error(format!(
                "keepalive ({}s) must be shorter than the read timeout ({}s)",
                self.keepalive_secs, self.read_timeout_secs
            )));
        }
        if self.queue_capacity == 0 {
            return Err(config_error("queue capacity must be at least one".to_string()));
        }
        if self.tokens().next().is_none() {
            return Err(config_error(
                "at least one access token is required (--auth-token or TETHER_AUTH_TOKEN)".to_string(),
            ));
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn initial_size(&self) -> Size {
        Size::new(self.rows, self.cols)
    }

    pub fn shell_config(&self) -> ShellConfig {
        ShellConfig::new(self.shell.clone(), self.initial_size())
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            queue_capacity: self.queue_capacity,
            keepalive_interval: Duration::from_secs(self.keepalive_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
        }
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry_interval_secs)
    }

    /// Non-blank tokens, trimmed
    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.auth_tokens.iter().map(|t| t.trim()).filter(|t| !t.is_empty())
    }
}

fn config_error(message: String) -> TetherError {
    TetherError::Config(message)
}
