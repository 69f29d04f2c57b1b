use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use taskport::config::ServerConfig;
use taskport::context::ServerContext;
use taskport::core::Scheduler;
use taskport::rpc::{Registry, RpcClient, RpcServer};
use taskport::web::WebServer;
use taskport::{endpoints, logging};
use tracing::info;

#[derive(Parser)]
#[command(name = "taskport")]
#[command(about = "Remote task control server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./taskport.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server
    Serve(ServerArgs),
    /// Send one request and print the reply
    Call(CallArgs),
}

#[derive(Args, Serialize)]
struct ServerArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    bind: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    health_bind: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    max_frame_size: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    max_message_size: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,
}

#[derive(Args)]
struct CallArgs {
    /// Method name
    method: String,

    /// Params as JSON
    #[arg(default_value = "null")]
    params: String,

    /// Server address (defaults to the configured bind address)
    #[arg(long)]
    addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Serve(args) => ServerConfig::load(cli.config.as_deref(), Some(args))?,
        Commands::Call(_) => ServerConfig::load::<ServerArgs>(cli.config.as_deref(), None)?,
    };
    logging::init(logging::LogConfig::from(&config));

    match cli.command {
        Commands::Serve(_) => run_server(config).await.context("Failed to run server")?,
        Commands::Call(args) => run_call(&config, args).await.context("Call failed")?,
    }

    Ok(())
}

async fn run_server(config: ServerConfig) -> Result<()> {
    let mut registry = Registry::new(Scheduler::new());
    endpoints::register_all(&mut registry).context("Failed to register endpoints")?;

    let health_bind = config.health_bind;
    let ctx = ServerContext::new(config, registry);
    let rpc = Arc::new(RpcServer::bind(ctx.clone(), ctx.config.bind).await?);
    let web = health_bind.map(|addr| Arc::new(WebServer::new(ctx.clone(), addr)));

    let rpc_task = tokio::spawn({
        let rpc = rpc.clone();
        async move { rpc.start().await }
    });
    let web_task = web.clone().map(|web| tokio::spawn(async move { web.start().await }));

    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
    info!("Shutting down");

    rpc.shutdown();
    if let Some(web) = &web {
        web.shutdown();
    }
    ctx.scheduler().shutdown().await;

    rpc_task.await??;
    if let Some(task) = web_task {
        task.await??;
    }
    Ok(())
}

async fn run_call(config: &ServerConfig, args: CallArgs) -> Result<()> {
    let params: Value = serde_json::from_str(&args.params).context("params must be valid JSON")?;
    let addr = args.addr.unwrap_or(config.bind);

    let mut client = RpcClient::connect(addr).await?;
    let result = client
        .call_with_progress(&args.method, params, |update| {
            eprintln!("[{:>5.1}%] {}", update.amount * 100.0, update.operation);
        })
        .await;
    client.close().await;

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}
