mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{middleware, routing::get, Router};
use benchconf::{BenchConfig, ConfigSources};
use benchlog::middleware::{record_timing, trace_region};
use benchlog::web::{self, AdminState};
use benchlog::{CoordinatorConfig, Marker, ProfilingBackend, SessionCoordinator, ShellMarker, TimingRecorder};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Profiling sessions and access timing for a service under benchmark
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file to load instead of ./benchlog.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the admin API and /ping (default)
    Serve {
        /// Port to listen on, overriding bind.http_port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Print the effective configuration and where it came from
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, sources) = BenchConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Config => {
            print_config(&config, &sources);
            Ok(())
        }
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.bind.http_port = port;
            }
            telemetry::init(&config.telemetry.log_level)?;
            for file in &sources.files {
                info!("Loaded config from {}", file.display());
            }
            run(config).await
        }
    }
}

fn print_config(config: &BenchConfig, sources: &ConfigSources) {
    println!("{}", config.to_toml());
    if sources.files.is_empty() {
        println!("# no config files found, using defaults");
    }
    for file in &sources.files {
        println!("# loaded: {}", file.display());
    }
    for var in &sources.env_overrides {
        println!("# env override: {}", var);
    }
}

async fn run(config: BenchConfig) -> Result<()> {
    std::fs::create_dir_all(&config.paths.output_dir).with_context(|| {
        format!(
            "Failed to create output directory {}",
            config.paths.output_dir.display()
        )
    })?;

    let recorder =
        TimingRecorder::open(config.paths.access_log_path()).context("Failed to open access log")?;
    let marker: Arc<dyn Marker> = Arc::new(ShellMarker::from_config(&config.marker));

    #[cfg(feature = "pprof")]
    let backend = benchlog::capture::PprofBackend::new(
        config.profiling.cpu_frequency,
        config.profiling.trace_interval(),
    );
    #[cfg(not(feature = "pprof"))]
    let backend = benchlog::ProcfsBackend::new(config.profiling.trace_interval());

    serve(config, backend, marker, recorder).await
}

async fn ping() -> &'static str {
    "pong"
}

async fn serve<B: ProfilingBackend>(
    config: BenchConfig,
    backend: B,
    marker: Arc<dyn Marker>,
    recorder: TimingRecorder,
) -> Result<()> {
    let coordinator =
        SessionCoordinator::new(backend, marker, CoordinatorConfig::from_config(&config));

    let admin = web::router(AdminState {
        coordinator: coordinator.clone(),
        benchmark: config.profiling.benchmark_duration(),
    });

    let app = Router::new()
        .route("/ping", get(ping))
        .merge(admin)
        .layer(middleware::from_fn_with_state(recorder.clone(), record_timing))
        .layer(middleware::from_fn(trace_region));

    let addr = config.bind.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!(
        output_dir = %config.paths.output_dir.display(),
        access_log = %recorder.path().display(),
        trace = config.profiling.trace,
        benchmark_secs = config.profiling.benchmark_secs,
        "benchlog listening on http://{}",
        addr
    );

    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    wait_for_signal().await;
    shutdown.cancel();

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Server shutdown with error: {:?}", e),
        Err(e) => error!("Server task failed: {}", e),
    }

    coordinator
        .shutdown()
        .await
        .context("Failed to finalize running profiling session")?;

    info!("Shutdown complete");
    Ok(())
}

/// Resolve on SIGINT, or SIGTERM on unix.
async fn wait_for_signal() {
    let terminate = async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down gracefully..."),
        _ = terminate => info!("Received SIGTERM, shutting down gracefully..."),
    }
}
