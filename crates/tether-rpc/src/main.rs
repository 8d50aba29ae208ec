//! tether CLI - send RPC calls through configured invokers.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tether_rpc::bridge::TcpOnlyHook;
use tether_rpc::channel::ChannelContext;
use tether_rpc::routing::StaticRoutingTable;
use tether_rpc::{Invoker, InvokerContext, RpcRequest, TetherConfig};

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Send RPC calls through tether invokers")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = "tether.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Perform one call and print the response body
    Invoke {
        /// Invoker name in the configuration file
        #[arg(short, long)]
        invoker: String,

        /// Request id
        #[arg(long, default_value = "1")]
        id: String,

        /// Method, or HTTP path for HTTP channels
        #[arg(short, long, default_value = "")]
        method: String,

        /// Request header as key=value, repeatable
        #[arg(short = 'H', long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        /// Timeout in milliseconds (0 uses the header override or the default)
        #[arg(short, long, default_value_t = 0)]
        timeout: u32,

        /// Request body
        data: String,
    },

    /// Validate the configuration and build every invoker
    Check,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
        .ok_or_else(|| format!("header {raw} is not key=value"))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = TetherConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let routing = Arc::new(StaticRoutingTable::from_config(&config.routing));
    let ctx = InvokerContext::new(ChannelContext::new(Arc::new(TcpOnlyHook)).with_routing(routing));

    match cli.command {
        Commands::Invoke {
            invoker,
            id,
            method,
            headers,
            timeout,
            data,
        } => {
            let invoker = Invoker::new(config.invoker(&invoker)?, &ctx)?;

            let mut req = RpcRequest::new(id, method, data).with_timeout_ms(timeout);
            for (key, value) in headers {
                req.header.append(key, value);
            }

            let resp = invoker.invoke(req).await?;
            if let Some(remote) = &resp.error {
                bail!("remote error {}: {}", remote.status, remote.message);
            }
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&resp.data)?;
            stdout.write_all(b"\n")?;
        }
        Commands::Check => {
            let mut names: Vec<&String> = config.invokers.keys().collect();
            names.sort();
            for name in names {
                let invoker = Invoker::new(&config.invokers[name], &ctx)
                    .with_context(|| format!("invoker {name}"))?;
                println!("{name}: {} replica(s)", invoker.replicas());
            }
        }
    }

    Ok(())
}
