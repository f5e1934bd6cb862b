//! Node configuration, from command-line flags with environment fallbacks.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use proglog::log::LogConfig;
use proglog::membership::MembershipConfig;
use proglog::raft::RaftOptions;
use proglog::tls::TlsArgs;

#[derive(Parser, Debug, Clone)]
#[command(name = "proglog")]
#[command(about = "proglog - a replicated commit log")]
pub struct Config {
    /// Directory holding the user-data and consensus logs
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Unique node id; also the gossip member name
    #[arg(long, env = "NODE_ID", default_value_t = 1)]
    pub node_id: u64,

    /// Gossip address; its host is also used for the RPC listener
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:8401")]
    pub bind_addr: String,

    /// Port for client and consensus RPCs
    #[arg(long, env = "RPC_PORT", default_value_t = 8400)]
    pub rpc_port: u16,

    /// Gossip addresses of existing members. Empty bootstraps a new cluster.
    #[arg(long, env = "START_JOIN_ADDRS", value_delimiter = ',')]
    pub start_join_addrs: Vec<String>,

    #[arg(long, env = "SERVER_TLS_CERT_FILE")]
    pub server_tls_cert_file: Option<PathBuf>,

    #[arg(long, env = "SERVER_TLS_KEY_FILE")]
    pub server_tls_key_file: Option<PathBuf>,

    #[arg(long, env = "SERVER_TLS_CA_FILE")]
    pub server_tls_ca_file: Option<PathBuf>,

    #[arg(long, env = "PEER_TLS_CERT_FILE")]
    pub peer_tls_cert_file: Option<PathBuf>,

    #[arg(long, env = "PEER_TLS_KEY_FILE")]
    pub peer_tls_key_file: Option<PathBuf>,

    #[arg(long, env = "PEER_TLS_CA_FILE")]
    pub peer_tls_ca_file: Option<PathBuf>,

    /// `subject,object,action` policy; every request is allowed without one
    #[arg(long, env = "ACL_POLICY_FILE")]
    pub acl_policy_file: Option<PathBuf>,

    #[arg(long, env = "MAX_STORE_BYTES", default_value_t = 1 << 20)]
    pub max_store_bytes: u64,

    #[arg(long, env = "MAX_INDEX_BYTES", default_value_t = 1 << 20)]
    pub max_index_bytes: u64,

    #[arg(long, env = "HEARTBEAT_INTERVAL_MS", default_value_t = 50)]
    pub heartbeat_interval_ms: u64,

    #[arg(long, env = "ELECTION_TIMEOUT_MS", default_value_t = 300)]
    pub election_timeout_ms: u64,

    #[arg(long, env = "APPLY_TIMEOUT_MS", default_value_t = 10_000)]
    pub apply_timeout_ms: u64,

    #[arg(long, env = "GOSSIP_INTERVAL_MS", default_value_t = 200)]
    pub gossip_interval_ms: u64,

    #[arg(long, env = "SUSPECT_TIMEOUT_MS", default_value_t = 5_000)]
    pub suspect_timeout_ms: u64,

    /// Bound on each voter change triggered by gossip
    #[arg(long, env = "RECONCILE_TIMEOUT_MS", default_value_t = 10_000)]
    pub reconcile_timeout_ms: u64,

    /// trace, debug, info, warn or error; RUST_LOG overrides it
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn bootstrap(&self) -> bool {
        self.start_join_addrs.is_empty()
    }

    /// `<host of bind_addr>:<rpc_port>`.
    pub fn rpc_addr(&self) -> anyhow::Result<String> {
        let Some((host, _)) = self.bind_addr.rsplit_once(':') else {
            bail!("bind address {:?} has no port", self.bind_addr);
        };
        Ok(format!("{}:{}", host, self.rpc_port))
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            max_store_bytes: self.max_store_bytes,
            max_index_bytes: self.max_index_bytes,
            initial_offset: 0,
        }
        .normalized()
    }

    pub fn raft_options(&self) -> anyhow::Result<RaftOptions> {
        Ok(RaftOptions {
            node_id: self.node_id,
            rpc_addr: self.rpc_addr()?,
            bootstrap: self.bootstrap(),
            log: self.log_config(),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            election_timeout: Duration::from_millis(self.election_timeout_ms),
            apply_timeout: Duration::from_millis(self.apply_timeout_ms),
            ..Default::default()
        })
    }

    pub fn membership_config(&self) -> anyhow::Result<MembershipConfig> {
        let config = MembershipConfig {
            node_name: self.node_id.to_string(),
            bind_addr: self.bind_addr.clone(),
            start_join_addrs: self.start_join_addrs.clone(),
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            suspect_timeout: Duration::from_millis(self.suspect_timeout_ms),
            ..Default::default()
        };
        Ok(config.with_rpc_addr(self.rpc_addr()?))
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_millis(self.reconcile_timeout_ms)
    }

    /// TLS for accepted connections, when a certificate is configured.
    pub fn server_tls(&self) -> Option<TlsArgs> {
        self.server_tls_cert_file.as_ref()?;
        Some(TlsArgs {
            cert_file: self.server_tls_cert_file.clone(),
            key_file: self.server_tls_key_file.clone(),
            ca_file: self.server_tls_ca_file.clone(),
            server_address: String::new(),
        })
    }

    /// TLS for connections dialed to other nodes, when a CA is configured.
    pub fn peer_tls(&self) -> anyhow::Result<Option<TlsArgs>> {
        if self.peer_tls_ca_file.is_none() {
            return Ok(None);
        }
        let rpc_addr = self.rpc_addr()?;
        let host = rpc_addr
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .context("rpc address has no host")?;
        Ok(Some(TlsArgs {
            cert_file: self.peer_tls_cert_file.clone(),
            key_file: self.peer_tls_key_file.clone(),
            ca_file: self.peer_tls_ca_file.clone(),
            server_address: host,
        }))
    }
}
