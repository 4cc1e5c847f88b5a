mod metrics_http;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use arrow_flight::flight_service_server::FlightServiceServer;
use clap::{Args, Parser, Subcommand};
use porter_core::auth::{NoAuth, StaticVerifier, Verifier};
use porter_core::backend;
use porter_core::config::ServerConfig;
use porter_core::pool::{Pool, PoolConfig};
use porter_core::service::{GatewayState, PorterFlightSqlService};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Identity, Server, ServerTlsConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

const EXIT_CONFIG: u8 = 1;
const EXIT_BIND: u8 = 2;
const EXIT_BACKEND: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "porter", version, about = "Arrow Flight SQL gateway for analytic backends")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the gateway.
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Flight SQL bind address.
    #[arg(long, value_name = "HOST:PORT")]
    address: Option<String>,
    /// Backend DSN (embedded://... or remote://...).
    #[arg(long, value_name = "DSN")]
    database: Option<String>,
    /// YAML configuration file.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, value_parser = ["debug", "info", "warn", "error"])]
    log_level: Option<String>,
    #[arg(long, value_name = "N")]
    max_connections: Option<usize>,
    /// Serve Prometheus metrics and the health probe.
    #[arg(long)]
    metrics: bool,
    #[arg(long, value_name = "HOST:PORT")]
    metrics_address: Option<String>,
    /// Enable TLS; requires --tls-cert and --tls-key.
    #[arg(long)]
    tls: bool,
    #[arg(long, value_name = "PATH", requires = "tls")]
    tls_cert: Option<String>,
    #[arg(long, value_name = "PATH", requires = "tls")]
    tls_key: Option<String>,
    /// Require client authentication.
    #[arg(long)]
    auth: bool,
    /// Token for the hosted embedded engine.
    #[arg(long, value_name = "TOKEN")]
    token: Option<String>,
}

/// Failure paths carry the process exit code the operator contract
/// promises.
struct FatalError {
    code: u8,
    source: anyhow::Error,
}

impl FatalError {
    fn config(source: anyhow::Error) -> Self {
        Self {
            code: EXIT_CONFIG,
            source,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let Command::Serve(args) = cli.command;

    match serve(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(fatal) => {
            eprintln!("porter: {:#}", fatal.source);
            ExitCode::from(fatal.code)
        }
    }
}

async fn serve(args: ServeArgs) -> Result<(), FatalError> {
    let config = load_config(&args).map_err(FatalError::config)?;
    init_tracing(&config);
    info!(dsn = %config.database.dsn, "resolved configuration");

    let addr = config.bind_addr().map_err(FatalError::config)?;

    let connector = backend::open(&config.database)
        .map_err(|err| FatalError::config(anyhow!(err)))?;
    let backend_kind = connector.kind();
    let backend_identity = connector.identity().to_string();
    let pool = Pool::new(connector, PoolConfig::from(&config.server));

    if config.server.startup_health_check {
        pool.ping_now().map_err(|err| FatalError {
            code: EXIT_BACKEND,
            source: anyhow!(err).context("backend unreachable at startup"),
        })?;
        info!("startup health check passed");
    }

    let state = Arc::new(GatewayState::new(
        &config,
        pool,
        backend_kind,
        backend_identity,
    ));
    let verifier: Arc<dyn Verifier> = if config.auth.enabled {
        Arc::new(StaticVerifier::from_config(&config.auth))
    } else {
        Arc::new(NoAuth)
    };
    let flight_service = PorterFlightSqlService::new(Arc::clone(&state), verifier);

    PorterFlightSqlService::spawn_reaper(
        Arc::clone(&state),
        Duration::from_secs(config.server.health_check_period_seconds.max(1)),
    );
    metrics_http::spawn_metrics_server(&config, Arc::clone(&state))
        .map_err(FatalError::config)?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| FatalError {
            code: EXIT_BIND,
            source: anyhow!(err).context(format!("failed to bind {addr}")),
        })?;
    info!(%addr, backend = %backend_kind, "starting Flight SQL gateway");

    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<FlightServiceServer<PorterFlightSqlService>>()
        .await;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        wait_for_signal().await;
        health_reporter
            .set_not_serving::<FlightServiceServer<PorterFlightSqlService>>()
            .await;
        let _ = shutdown_tx.send(());
    });

    let mut builder = Server::builder();
    if config.tls.enabled {
        let cert = std::fs::read(config.tls.cert_path.as_deref().unwrap_or_default())
            .context("failed to read TLS certificate")
            .map_err(FatalError::config)?;
        let key = std::fs::read(config.tls.key_path.as_deref().unwrap_or_default())
            .context("failed to read TLS key")
            .map_err(FatalError::config)?;
        builder = builder
            .tls_config(ServerTlsConfig::new().identity(Identity::from_pem(cert, key)))
            .context("invalid TLS configuration")
            .map_err(FatalError::config)?;
    }

    builder
        .add_service(health_service)
        .add_service(FlightServiceServer::new(flight_service))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
            shutdown_rx.await.ok();
        })
        .await
        .context("Flight SQL server terminated unexpectedly")
        .map_err(FatalError::config)?;

    info!("server shutdown complete");
    Ok(())
}

/// Layer CLI flags over the file/env configuration.
fn load_config(args: &ServeArgs) -> Result<ServerConfig> {
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("failed to load configuration")?;

    if let Some(address) = &args.address {
        config.server.address = address.clone();
    }
    if let Some(database) = &args.database {
        config.database.dsn = database.clone();
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if let Some(max) = args.max_connections {
        config.server.max_connections = max;
    }
    if args.metrics {
        config.metrics.enabled = true;
    }
    if let Some(metrics_address) = &args.metrics_address {
        config.metrics.address = metrics_address.clone();
    }
    if args.tls {
        config.tls.enabled = true;
        config.tls.cert_path = args.tls_cert.clone();
        config.tls.key_path = args.tls_key.clone();
    }
    if args.auth {
        config.auth.enabled = true;
    }
    if let Some(token) = &args.token {
        config.database.token = Some(token.clone());
    }

    if config.tls.enabled && (config.tls.cert_path.is_none() || config.tls.key_path.is_none()) {
        anyhow::bail!("--tls requires --tls-cert and --tls-key (or the tls config section)");
    }
    if config.auth.enabled
        && config.auth.username.is_none()
        && config.auth.token.is_none()
    {
        anyhow::bail!("--auth requires credentials in the auth config section or PORTER_AUTH_TOKEN");
    }
    Ok(config)
}

fn init_tracing(config: &ServerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .compact()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received SIGINT, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serve_args(extra: &[&str]) -> ServeArgs {
        let mut argv = vec!["porter", "serve"];
        argv.extend_from_slice(extra);
        let cli = Cli::try_parse_from(argv).expect("parse");
        let Command::Serve(args) = cli.command;
        args
    }

    #[test]
    fn cli_flags_override_config() -> Result<()> {
        let args = serve_args(&[
            "--address",
            "127.0.0.1:5005",
            "--database",
            "remote://ch:9000/db",
            "--max-connections",
            "3",
            "--metrics",
            "--log-level",
            "warn",
        ]);
        let config = load_config(&args)?;
        assert_eq!(config.server.address, "127.0.0.1:5005");
        assert_eq!(config.database.dsn, "remote://ch:9000/db");
        assert_eq!(config.server.max_connections, 3);
        assert!(config.metrics.enabled);
        assert_eq!(config.logging.level, "warn");
        Ok(())
    }

    #[test]
    fn tls_flag_without_material_is_a_config_error() {
        let err = Cli::try_parse_from(["porter", "serve", "--tls-cert", "/tmp/c.pem"])
            .expect_err("--tls-cert requires --tls");
        assert!(err.to_string().contains("--tls"));

        let args = serve_args(&["--tls"]);
        assert!(load_config(&args).is_err());
    }

    #[test]
    fn auth_flag_requires_credentials() {
        let args = serve_args(&["--auth"]);
        assert!(load_config(&args).is_err());

        let args = serve_args(&["--auth"]);
        std::env::set_var("PORTER_AUTH_TOKEN", "tok");
        let config = load_config(&args).expect("token satisfies auth");
        std::env::remove_var("PORTER_AUTH_TOKEN");
        assert!(config.auth.enabled);
        assert_eq!(config.auth.token.as_deref(), Some("tok"));
    }

    #[test]
    fn default_database_is_embedded_memory() -> Result<()> {
        let args = serve_args(&[]);
        let config = load_config(&args)?;
        assert_eq!(config.database.dsn, "embedded://:memory:");
        assert_eq!(config.bind_addr()?.port(), 32010);
        Ok(())
    }
}
