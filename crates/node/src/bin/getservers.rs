//! Prints the servers a proglog node knows about.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use clap::Parser;
use proglog::api::{ClientRequest, ClientResponse};
use proglog::router::{ClientTls, Conn};
use proglog::tls::{self, TlsArgs};

#[derive(Parser, Debug)]
#[command(name = "getservers")]
#[command(about = "List the servers in a proglog cluster")]
struct Args {
    /// RPC address of any member
    #[arg(long, default_value = "127.0.0.1:8400")]
    addr: String,

    #[arg(long)]
    ca_file: Option<PathBuf>,

    #[arg(long)]
    cert_file: Option<PathBuf>,

    #[arg(long)]
    key_file: Option<PathBuf>,

    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let tls = match &args.ca_file {
        Some(ca_file) => {
            let tls_args = TlsArgs {
                cert_file: args.cert_file.clone(),
                key_file: args.key_file.clone(),
                ca_file: Some(ca_file.clone()),
                server_address: String::new(),
            };
            Some(ClientTls {
                connector: tls::connector(&tls_args)?,
                server_name: None,
            })
        }
        None => None,
    };

    let conn = Conn::new(
        args.addr.clone(),
        Duration::from_millis(args.timeout_ms),
        tls,
    );
    let servers = match conn.call(&ClientRequest::GetServers).await? {
        ClientResponse::Servers { servers } => servers,
        ClientResponse::Error(e) => bail!("{} failed: {}", args.addr, e),
        other => bail!("unexpected response: {:?}", other),
    };

    println!("servers:");
    for server in servers {
        let role = if server.is_leader { "leader" } else { "follower" };
        println!("- id: {}\trpc_addr: {}\t{}", server.id, server.rpc_addr, role);
    }
    Ok(())
}
