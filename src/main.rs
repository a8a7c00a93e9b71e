use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;

use wogate::config::{ServeConfig, ServerMode};
use wogate::server;

#[derive(Parser, Debug)]
#[command(
    name = "wogate",
    about = "Local HTTP gateway to the Wo cloud drive",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the gateway (the default when no subcommand is given)
    Run(ServeArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Bind address
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Scheduling model for the runtime
    #[arg(long, value_enum, default_value_t = ServerMode::Auto)]
    server: ServerMode,

    /// Runtime worker count (0 = runtime default)
    #[arg(long, default_value_t = 0)]
    workers: usize,

    /// Runtime thread count; takes precedence over --workers
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Token pool file
    #[arg(long, default_value = "tokens.json")]
    tokens: PathBuf,

    /// Scratch directory for multipart intake (default: unique temp dir)
    #[arg(long)]
    scratch: Option<PathBuf>,
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            server: ServerMode::Auto,
            workers: 0,
            threads: 0,
            tokens: PathBuf::from("tokens.json"),
            scratch: None,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wogate=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let args = match cli.command {
        Some(Commands::Run(args)) => args,
        None => ServeArgs::default(),
    };

    let config = match ServeConfig::new(
        args.host,
        args.port,
        args.server,
        args.workers,
        args.threads,
        args.tokens,
        args.scratch,
    ) {
        Ok(config) => config,
        Err(err) => {
            error!("invalid configuration: {err}");
            return ExitCode::from(1);
        }
    };

    let runtime = match build_runtime(&config) {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("failed to start runtime: {err}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(server::serve(config)) {
        Ok(true) => ExitCode::from(130),
        Ok(false) => ExitCode::SUCCESS,
        Err(err) => {
            error!("startup failed: {err}");
            ExitCode::from(1)
        }
    }
}

fn build_runtime(config: &ServeConfig) -> std::io::Result<tokio::runtime::Runtime> {
    match config.mode {
        ServerMode::Async => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build(),
        ServerMode::Auto | ServerMode::Threaded => {
            let mut builder = tokio::runtime::Builder::new_multi_thread();
            if let Some(threads) = config.worker_threads() {
                builder.worker_threads(threads);
            }
            builder.enable_all().build()
        }
    }
}
