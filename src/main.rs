use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use murloc::config::{Mode, TransportKind};
use murloc::rpc::{DispatchPolicy, HttpClient, LineClient, WireFormat};
use murloc::{Method, MethodRegistry, Server, ServerConfig, logging};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "murloc")]
#[command(about = "Extensible request/response server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./murloc.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server with the demo methods
    Serve(ServerArgs),
    /// Send a single request to a running server
    Call(CallArgs),
    /// Print the effective configuration
    Config(ServerArgs),
}

#[derive(Args, Serialize)]
struct ServerArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    host: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    mode: Option<Mode>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    transport: Option<TransportKind>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    line_format: Option<WireFormat>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    dispatch: Option<DispatchPolicy>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    logfile: Option<PathBuf>,
}

#[derive(Args)]
struct CallArgs {
    /// Line transport address
    #[arg(long, default_value = "127.0.0.1:8048", conflicts_with = "http")]
    addr: String,

    /// HTTP transport URL, e.g. http://127.0.0.1:8048/
    #[arg(long)]
    http: Option<String>,

    method: String,

    params: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    murloc::rpc::block_on_abandoning(run(cli)).context("Failed to start runtime")?
}

async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::Serve(args) => {
            let config = ServerConfig::load(cli.config.as_deref(), Some(args))?;
            logging::init(logging::LogConfig::from(&config));
            run_server(config).await.context("Server stopped")?
        }
        Commands::Call(args) => run_call(args).await.context("Request failed")?,
        Commands::Config(args) => {
            let config = ServerConfig::load(cli.config.as_deref(), Some(args))?;
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

async fn run_server(config: ServerConfig) -> Result<()> {
    let server = Server::bind(config, demo_methods()?).await?;
    server.run().await?;
    Ok(())
}

fn demo_methods() -> Result<MethodRegistry> {
    let registry = MethodRegistry::new()
        .route("hello", Method::no_params(|| Ok("hello, world!")))?
        .route("echo", Method::with_params(Ok))?
        .route(
            "myfunc",
            Method::optional_params(|params: Option<Value>| {
                Ok(format!("args={}", params.unwrap_or(Value::Null)))
            }),
        )?
        .route(
            "time",
            Method::no_params(|| Ok(chrono::Utc::now().to_rfc3339())),
        )?;
    Ok(registry)
}

async fn run_call(args: &CallArgs) -> Result<()> {
    let response = match &args.http {
        Some(url) => {
            let params = (!args.params.is_empty()).then(|| {
                Value::Array(args.params.iter().cloned().map(Value::String).collect())
            });
            HttpClient::new(url.as_str()).call(&args.method, params).await?
        }
        None => {
            let mut client = LineClient::connect(args.addr.as_str()).await?;
            let params: Vec<&str> = args.params.iter().map(String::as_str).collect();
            let response = client.call(&args.method, &params).await?;
            client.close().await?;
            response
        }
    };

    println!("{}", response.to_json());
    if !response.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
