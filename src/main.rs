//! # toolbridge CLI
//!
//! - `toolbridge serve math` - run one self-hosted provider
//! - `toolbridge serve-all` - run math and weather until Ctrl-C
//! - `toolbridge tools` - list the aggregated tool set
//! - `toolbridge call add '{"a": 2, "b": 3}'` - invoke one tool
//! - `toolbridge launcher` - run the process launcher API

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::net::{lookup_host, TcpListener};

use toolbridge::config::Settings;
use toolbridge::launcher::{self, ProcessTable};
use toolbridge::logging::{init_tracing, LogTarget};
use toolbridge::mcp_client::MultiProviderManager;
use toolbridge::providers::{self, serve_sse, serve_stdio, SseServer};
use toolbridge::tracker::UsageTracker;

const LAUNCHER_PORT: u16 = 10000;

/// toolbridge - one tool set over many MCP providers
#[derive(Parser)]
#[command(name = "toolbridge")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Aggregate tools from multiple MCP providers")]
struct Cli {
    /// Log to a file instead of stderr (default: data dir/toolbridge.log)
    #[arg(long, global = true, num_args = 0..=1, value_name = "PATH")]
    log_file: Option<Option<PathBuf>>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve one self-hosted provider
    Serve {
        /// Provider to serve
        provider: BuiltinProvider,

        #[arg(long, value_enum, default_value_t = ServeTransport::Sse)]
        transport: ServeTransport,

        /// Bind host (default: IP_HOST)
        #[arg(long)]
        host: Option<String>,

        /// Bind port (default: MATH_PORT / WEATHER_PORT)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Serve math and weather on their configured ports until Ctrl-C
    ServeAll,

    /// List the tools of the given providers (default: all configured)
    Tools { providers: Vec<String> },

    /// Invoke one tool
    Call {
        /// Tool name
        tool: String,

        /// JSON object of arguments
        #[arg(default_value = "{}")]
        arguments: String,

        /// Comma-separated providers to open (default: all configured)
        #[arg(long, value_delimiter = ',')]
        providers: Vec<String>,

        /// Record the call and print usage afterwards
        #[arg(long)]
        track: bool,
    },

    /// Run the process launcher API
    Launcher {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        #[arg(long, default_value_t = LAUNCHER_PORT)]
        port: u16,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum BuiltinProvider {
    Math,
    Weather,
}

impl BuiltinProvider {
    fn name(self) -> &'static str {
        match self {
            BuiltinProvider::Math => "math",
            BuiltinProvider::Weather => "weather",
        }
    }

    fn port(self, settings: &Settings) -> u16 {
        match self {
            BuiltinProvider::Math => settings.math_port(),
            BuiltinProvider::Weather => settings.weather_port(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ServeTransport {
    Sse,
    Stdio,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let target = match cli.log_file {
        None => LogTarget::Stderr,
        Some(None) => LogTarget::default_file(),
        Some(Some(path)) => LogTarget::File(path),
    };
    init_tracing(target, cli.json_logs).context("failed to initialize logging")?;

    let settings = Settings::from_env()?;

    match cli.command {
        Commands::Serve {
            provider,
            transport,
            host,
            port,
        } => serve(&settings, provider, transport, host, port).await,
        Commands::ServeAll => serve_all(&settings).await,
        Commands::Tools { providers } => list_tools(settings, providers).await,
        Commands::Call {
            tool,
            arguments,
            providers,
            track,
        } => call_tool(settings, providers, &tool, &arguments, track).await,
        Commands::Launcher { host, port } => run_launcher(&settings, &host, port).await,
    }
}

async fn serve(
    settings: &Settings,
    provider: BuiltinProvider,
    transport: ServeTransport,
    host: Option<String>,
    port: Option<u16>,
) -> Result<()> {
    let registry = providers::builtin(provider.name())
        .with_context(|| format!("no built-in provider '{}'", provider.name()))?;

    if transport == ServeTransport::Stdio {
        return serve_stdio(registry).await.context("stdio provider failed");
    }

    let host = host.unwrap_or_else(|| settings.host().to_string());
    let addr = resolve_addr(&host, port.unwrap_or_else(|| provider.port(settings))).await?;
    serve_sse(registry, addr, ctrl_c()).await?;
    Ok(())
}

async fn serve_all(settings: &Settings) -> Result<()> {
    let mut servers = Vec::new();
    for provider in [BuiltinProvider::Math, BuiltinProvider::Weather] {
        let Some(registry) = providers::builtin(provider.name()) else {
            continue;
        };
        let addr = resolve_addr(settings.host(), provider.port(settings)).await?;
        let server = SseServer::bind(registry, addr)
            .await
            .with_context(|| format!("failed to bind {} on {addr}", provider.name()))?;
        println!("{} provider: {}", provider.name(), server.url());
        servers.push(server);
    }

    ctrl_c().await;
    for server in servers {
        server.shutdown().await;
    }
    Ok(())
}

async fn list_tools(settings: Settings, names: Vec<String>) -> Result<()> {
    let names = default_providers(&settings, names);
    MultiProviderManager::scoped(settings, &names, |tools| async move {
        for tool in &tools {
            println!("{:<20} [{}] {}", tool.name(), tool.provider(), tool.description());
        }
        Ok::<_, anyhow::Error>(())
    })
    .await
}

async fn call_tool(
    settings: Settings,
    names: Vec<String>,
    tool_name: &str,
    arguments: &str,
    track: bool,
) -> Result<()> {
    let arguments: serde_json::Value =
        serde_json::from_str(arguments).context("arguments must be a JSON object")?;
    if !arguments.is_object() {
        bail!("arguments must be a JSON object");
    }

    let names = default_providers(&settings, names);
    let tracker = track.then(|| UsageTracker::new("cli"));

    let result = MultiProviderManager::scoped(settings, &names, |tools| {
        let tracker = tracker.clone();
        async move {
            let tools = match &tracker {
                Some(tracker) => tracker.wrap(tools),
                None => tools,
            };
            let tool = tools
                .iter()
                .find(|t| t.name() == tool_name)
                .with_context(|| format!("no tool named '{tool_name}'"))?;
            Ok::<_, anyhow::Error>(tool.invoke(arguments).await?)
        }
    })
    .await?;

    println!("{}", serde_json::to_string_pretty(&result)?);

    if let Some(tracker) = tracker {
        for (tool, count) in tracker.usage_stats() {
            eprintln!("{tool}: {count} call(s)");
        }
    }
    Ok(())
}

async fn run_launcher(settings: &Settings, host: &str, port: u16) -> Result<()> {
    let addr = resolve_addr(host, port).await?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind launcher on {addr}"))?;
    let table = Arc::new(ProcessTable::new(settings.shutdown_grace()));
    launcher::serve(table, listener, ctrl_c()).await?;
    Ok(())
}

fn default_providers(settings: &Settings, names: Vec<String>) -> Vec<String> {
    if names.is_empty() {
        settings.provider_names().into_iter().map(String::from).collect()
    } else {
        names
    }
}

async fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr> {
    lookup_host((host, port))
        .await
        .with_context(|| format!("cannot resolve {host}:{port}"))?
        .next()
        .with_context(|| format!("no address for {host}:{port}"))
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("received Ctrl-C, shutting down");
}
