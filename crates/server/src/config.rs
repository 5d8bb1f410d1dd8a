//! Command-line and environment configuration.
//!
//! Every flag can also be set through an environment variable. The port keeps
//! the `MCP_PROXY_PORT` name the automation clients already use.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use thiserror::Error;

use crate::transport::{Backoff, ChildCommand, RestartPolicy};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_CONTENT_STORE: &str = "context-data";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroCapacity(&'static str),

    #[error("content store path must not be empty")]
    EmptyContentStore,

    #[error("child program must not be empty")]
    EmptyChildProgram,

    #[error("restart initial delay ({initial_ms}ms) exceeds maximum delay ({max_ms}ms)")]
    BackoffRange { initial_ms: u64, max_ms: u64 },
}

/// What to do when the child process exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RestartMode {
    /// Start once; forwarding goes inert after the child exits
    #[value(name = "none")]
    Never,
    /// Respawn with exponential backoff
    Backoff,
    /// Respawn only when `POST /child/restart` is called
    Manual,
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "mcp-relay",
    version,
    about = "Relay WebSocket automation clients to a single stdio MCP server"
)]
pub struct Config {
    /// Address to bind the WebSocket listener to
    #[arg(long, env = "MCP_RELAY_HOST", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub host: IpAddr,

    /// Port accepting WebSocket upgrades
    #[arg(long, env = "MCP_PROXY_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Content-store directory, as seen by the child process
    #[arg(long = "content-store", env = "MCP_RELAY_CONTENT_STORE", default_value = DEFAULT_CONTENT_STORE)]
    pub content_store: String,

    /// Program to run as the child MCP server
    #[arg(long, env = "MCP_RELAY_CHILD_PROGRAM", default_value = "npx")]
    pub child_program: String,

    /// Argument passed to the child program (repeatable)
    #[arg(
        long = "child-arg",
        env = "MCP_RELAY_CHILD_ARGS",
        value_delimiter = ' ',
        allow_hyphen_values = true,
        default_values_t = default_child_args()
    )]
    pub child_args: Vec<String>,

    /// Working directory for the child process
    #[arg(long, env = "MCP_RELAY_CHILD_CWD")]
    pub child_cwd: Option<PathBuf>,

    /// Restart policy for the child process
    #[arg(long, env = "MCP_RELAY_RESTART", value_enum, default_value_t = RestartMode::Never)]
    pub restart: RestartMode,

    #[arg(long, env = "MCP_RELAY_RESTART_INITIAL_MS", default_value_t = 500)]
    pub restart_initial_ms: u64,

    #[arg(long, env = "MCP_RELAY_RESTART_MAX_MS", default_value_t = 30_000)]
    pub restart_max_ms: u64,

    /// Consecutive failed restarts before giving up (0 = never give up)
    #[arg(long, env = "MCP_RELAY_RESTART_MAX_ATTEMPTS", default_value_t = 10)]
    pub restart_max_attempts: u32,

    /// Lines buffered for the child's stdin before new writes are dropped
    #[arg(long, env = "MCP_RELAY_CHILD_QUEUE", default_value_t = 256)]
    pub child_queue: usize,

    /// Frames buffered per client before new sends to it are dropped
    #[arg(long, env = "MCP_RELAY_CLIENT_QUEUE", default_value_t = 100)]
    pub client_queue: usize,

    /// Write logs to `<dir>/relay.log` instead of stderr
    #[arg(long, env = "MCP_RELAY_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

fn default_child_args() -> Vec<String> {
    vec![
        "-y".to_string(),
        "@modelcontextprotocol/server-filesystem".to_string(),
        format!("./{DEFAULT_CONTENT_STORE}"),
    ]
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.child_queue == 0 {
            return Err(ConfigError::ZeroCapacity("child queue"));
        }
        if self.client_queue == 0 {
            return Err(ConfigError::ZeroCapacity("client queue"));
        }
        if self.content_store.trim().is_empty() {
            return Err(ConfigError::EmptyContentStore);
        }
        if self.child_program.trim().is_empty() {
            return Err(ConfigError::EmptyChildProgram);
        }
        if self.restart_initial_ms > self.restart_max_ms {
            return Err(ConfigError::BackoffRange {
                initial_ms: self.restart_initial_ms,
                max_ms: self.restart_max_ms,
            });
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn child_command(&self) -> ChildCommand {
        ChildCommand {
            program: self.child_program.clone(),
            args: self
                .child_args
                .iter()
                .filter(|arg| !arg.is_empty())
                .cloned()
                .collect(),
            cwd: self.child_cwd.clone(),
        }
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        match self.restart {
            RestartMode::Never => RestartPolicy::Never,
            RestartMode::Manual => RestartPolicy::Manual,
            RestartMode::Backoff => RestartPolicy::Backoff(Backoff {
                initial: Duration::from_millis(self.restart_initial_ms),
                max: Duration::from_millis(self.restart_max_ms),
                max_attempts: self.restart_max_attempts,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["mcp-relay"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).expect("parse config")
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = parse(&[]);
        assert_eq!(config.port, 8080);
        assert_eq!(config.bind_addr().to_string(), "127.0.0.1:8080");
        assert_eq!(config.content_store, "context-data");
        assert_eq!(config.restart, RestartMode::Never);
        assert_eq!(config.restart_policy(), RestartPolicy::Never);

        let command = config.child_command();
        assert_eq!(command.program, "npx");
        assert_eq!(
            command.args,
            vec!["-y", "@modelcontextprotocol/server-filesystem", "./context-data"]
        );
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn repeated_child_args_replace_defaults() {
        let config = parse(&[
            "--child-program",
            "node",
            "--child-arg",
            "server.js",
            "--child-arg",
            "--stdio",
        ]);
        let command = config.child_command();
        assert_eq!(command.program, "node");
        assert_eq!(command.args, vec!["server.js", "--stdio"]);
    }

    #[test]
    fn backoff_policy_uses_configured_delays() {
        let config = parse(&[
            "--restart",
            "backoff",
            "--restart-initial-ms",
            "100",
            "--restart-max-ms",
            "1000",
            "--restart-max-attempts",
            "3",
        ]);
        assert_eq!(
            config.restart_policy(),
            RestartPolicy::Backoff(Backoff {
                initial: Duration::from_millis(100),
                max: Duration::from_millis(1000),
                max_attempts: 3,
            })
        );
    }

    #[test]
    fn manual_policy_parses() {
        assert_eq!(parse(&["--restart", "manual"]).restart_policy(), RestartPolicy::Manual);
    }

    #[test]
    fn rejects_invalid_values() {
        assert_eq!(
            parse(&["--child-queue", "0"]).validate(),
            Err(ConfigError::ZeroCapacity("child queue"))
        );
        assert_eq!(
            parse(&["--client-queue", "0"]).validate(),
            Err(ConfigError::ZeroCapacity("client queue"))
        );
        assert_eq!(
            parse(&["--content-store", " "]).validate(),
            Err(ConfigError::EmptyContentStore)
        );
        assert_eq!(
            parse(&["--restart-initial-ms", "5000", "--restart-max-ms", "10"]).validate(),
            Err(ConfigError::BackoffRange {
                initial_ms: 5000,
                max_ms: 10
            })
        );
    }
}
