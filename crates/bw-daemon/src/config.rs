//! Command line interface and path resolution.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;

use bw_core::{Limit, Mode, ModeParseError};
use bw_store::DEFAULT_FWD_HISTORY_LIMIT;

const NETWORKS: [&str; 4] = ["mainnet", "testnet", "regtest", "simnet"];

/// HTLC admission control for Lightning routing nodes.
#[derive(Parser)]
#[command(name = "breakwater", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the admission controller daemon.
    Daemon(DaemonArgs),

    /// List the default and per-peer limits with live counters.
    Listlimits(ClientArgs),

    /// Set the limit for one peer.
    Updatelimit(UpdateLimitArgs),

    /// Remove a peer's limit so it falls back to the default.
    Clearlimit(ClearLimitArgs),

    /// Replace the default limit.
    Updatedefaultlimit(UpdateDefaultLimitArgs),
}

#[derive(Args)]
pub struct DaemonArgs {
    /// host:port of the node's REST proxy.
    #[arg(long, default_value = "localhost:8080")]
    pub rpcserver: String,

    /// Path to the node's base directory.
    #[arg(long, default_value = "~/.lnd")]
    pub lnddir: String,

    /// Path to the TLS certificate. Defaults to tls.cert under lnddir.
    #[arg(long)]
    pub tlscertpath: Option<String>,

    /// Path to the admin macaroon. Defaults to the network's path under
    /// lnddir.
    #[arg(long)]
    pub macaroonpath: Option<String>,

    /// Network the node runs on: mainnet, testnet, regtest or simnet.
    #[arg(long, default_value = "mainnet")]
    pub network: String,

    /// Directory holding the database.
    #[arg(long, default_value = "~/.breakwater")]
    pub configdir: String,

    /// Management API listen address.
    #[arg(long, default_value = "127.0.0.1:9234")]
    pub listen: String,

    /// Forwarding history rows kept; zero disables history.
    #[arg(long, default_value_t = DEFAULT_FWD_HISTORY_LIMIT)]
    pub fwdhistorylimit: u64,

    /// Run against a synthetic host instead of a real node.
    #[arg(long)]
    pub stub: bool,
}

impl DaemonArgs {
    /// Resolve the TLS certificate and macaroon paths from the flags,
    /// falling back to the conventional locations under the node directory.
    pub fn credential_paths(&self) -> Result<(PathBuf, PathBuf), ConfigError> {
        let network = self.network.to_lowercase();
        if !NETWORKS.contains(&network.as_str()) {
            return Err(ConfigError::UnknownNetwork(self.network.clone()));
        }

        let lnd_dir = expand_path(&self.lnddir)?;

        let macaroon_path = match &self.macaroonpath {
            Some(path) => expand_path(path)?,
            None => lnd_dir
                .join("data")
                .join("chain")
                .join("bitcoin")
                .join(&network)
                .join("admin.macaroon"),
        };

        let tls_cert_path = match &self.tlscertpath {
            Some(path) => expand_path(path)?,
            None => lnd_dir.join("tls.cert"),
        };

        Ok((tls_cert_path, macaroon_path))
    }
}

#[derive(Args)]
pub struct ClientArgs {
    /// Management API address of a running daemon.
    #[arg(long, default_value = "http://127.0.0.1:9234")]
    pub rpc: String,
}

#[derive(Args)]
pub struct UpdateLimitArgs {
    #[command(flatten)]
    pub client: ClientArgs,

    /// 66-char hex node key.
    pub node: String,

    #[command(flatten)]
    pub limit: LimitArgs,
}

#[derive(Args)]
pub struct ClearLimitArgs {
    #[command(flatten)]
    pub client: ClientArgs,

    /// 66-char hex node key.
    pub node: String,
}

#[derive(Args)]
pub struct UpdateDefaultLimitArgs {
    #[command(flatten)]
    pub client: ClientArgs,

    #[command(flatten)]
    pub limit: LimitArgs,
}

#[derive(Args)]
pub struct LimitArgs {
    /// Maximum forwards per hour; zero means unlimited.
    #[arg(long, default_value_t = 0)]
    pub max_hourly_rate: i64,

    /// Maximum simultaneously pending HTLCs; zero means unlimited.
    #[arg(long, default_value_t = 0)]
    pub max_pending: i64,

    /// FAIL, QUEUE, QUEUE_PEER_INITIATED or BLOCK.
    #[arg(long, default_value = "FAIL")]
    pub mode: String,
}

impl LimitArgs {
    pub fn to_limit(&self) -> Result<Limit, ConfigError> {
        Ok(Limit {
            max_hourly_rate: self.max_hourly_rate,
            max_pending: self.max_pending,
            mode: self.mode.parse::<Mode>()?,
        })
    }
}

/// Startup configuration failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown network: {0}")]
    UnknownNetwork(String),

    #[error("cannot expand ~: no home directory")]
    NoHome,

    #[error(transparent)]
    Mode(#[from] ModeParseError),
}

/// Expand a leading `~` and POSIX-style `$VAR` references in a path.
pub fn expand_path(path: &str) -> Result<PathBuf, ConfigError> {
    let mut expanded = path.to_string();

    if let Some(rest) = expanded.strip_prefix('~') {
        let home = std::env::var("HOME").map_err(|_| ConfigError::NoHome)?;
        expanded = format!("{home}{rest}");
    }

    Ok(PathBuf::from(expand_env(&expanded)))
}

fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        let mut name = String::new();
        while let Some(&next) = chars.peek() {
            if next.is_ascii_alphanumeric() || next == '_' {
                name.push(next);
                chars.next();
            } else {
                break;
            }
        }

        if name.is_empty() {
            out.push('$');
        } else {
            out.push_str(&std::env::var(&name).unwrap_or_default());
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_network() {
        let args = DaemonArgs {
            rpcserver: String::new(),
            lnddir: "/tmp/lnd".to_string(),
            tlscertpath: None,
            macaroonpath: None,
            network: "liquid".to_string(),
            configdir: String::new(),
            listen: String::new(),
            fwdhistorylimit: 0,
            stub: false,
        };

        assert!(matches!(
            args.credential_paths(),
            Err(ConfigError::UnknownNetwork(_))
        ));
    }

    #[test]
    fn macaroon_path_follows_network() {
        let args = DaemonArgs {
            rpcserver: String::new(),
            lnddir: "/tmp/lnd".to_string(),
            tlscertpath: None,
            macaroonpath: None,
            network: "regtest".to_string(),
            configdir: String::new(),
            listen: String::new(),
            fwdhistorylimit: 0,
            stub: false,
        };

        let (tls_cert, macaroon) = args.credential_paths().unwrap();
        assert_eq!(tls_cert, PathBuf::from("/tmp/lnd/tls.cert"));
        assert_eq!(
            macaroon,
            PathBuf::from("/tmp/lnd/data/chain/bitcoin/regtest/admin.macaroon")
        );
    }

    #[test]
    fn expands_env_vars() {
        std::env::set_var("BW_TEST_DIR", "/data");
        assert_eq!(
            expand_path("$BW_TEST_DIR/certs").unwrap(),
            PathBuf::from("/data/certs")
        );
        assert_eq!(
            expand_path("/plain/path").unwrap(),
            PathBuf::from("/plain/path")
        );
    }

    #[test]
    fn limit_args_parse_mode() {
        let args = LimitArgs {
            max_hourly_rate: 60,
            max_pending: 2,
            mode: "QUEUE".to_string(),
        };
        assert_eq!(args.to_limit().unwrap().mode, Mode::Queue);

        let bad = LimitArgs {
            max_hourly_rate: 0,
            max_pending: 0,
            mode: "queue".to_string(),
        };
        assert!(bad.to_limit().is_err());
    }
}
