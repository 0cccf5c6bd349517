/// Keystone Service Main Entry Point
///
/// `start` brings the process up sealed: configuration, database pool,
/// migrations, then both listeners. Business endpoints serve only after
/// operators unseal the barrier through the admin API. `health` and
/// `shutdown` talk to a running instance over the admin listener.
///
/// Exit codes: 0 clean shutdown, 1 startup config/DB failure, 2 unseal
/// timeout, 3 fatal integrity error.
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use keystone_service::barrier::Barrier;
use keystone_service::config::Settings;
use keystone_service::db;
use keystone_service::http;
use keystone_service::security::password;
use keystone_service::services::jobs;
use keystone_service::services::keystore::SigningKeystore;
use keystone_service::state::ShutdownReason;
use keystone_service::telemetry::{self, BufferedSink};
use keystone_service::AppState;

#[derive(Parser, Debug)]
#[command(name = "keystone-service", version, about = "Keystone identity and key-management platform")]
struct Cli {
    /// YAML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Configuration overrides, `key=value`, highest precedence.
    #[arg(long = "override", value_name = "KEY=VALUE", global = true)]
    overrides: Vec<String>,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Run the service (default).
    Start,
    /// Probe a running instance's liveness over the admin listener.
    Health,
    /// Ask a running instance to shut down gracefully.
    Shutdown,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match Settings::load(cli.config.as_deref(), &cli.overrides) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            return ExitCode::from(1);
        }
    };

    telemetry::init_tracing(settings.telemetry.json_logs);

    match cli.command.unwrap_or(CliCommand::Start) {
        CliCommand::Start => run(settings).await,
        CliCommand::Health => health(&settings).await,
        CliCommand::Shutdown => remote_shutdown(&settings).await,
    }
}

async fn run(settings: Settings) -> ExitCode {
    info!("starting keystone service");
    let settings = Arc::new(settings);

    let pool = match db_pool::connect(&settings.database.pool_config()).await {
        Ok(pool) => pool,
        Err(err) => {
            error!(error = %err, "failed to connect to database");
            return ExitCode::from(1);
        }
    };

    if let Err(err) = db::run_migrations(&pool).await {
        error!(error = %err, "failed to run database migrations");
        return ExitCode::from(1);
    }
    info!("database migrations completed");

    let barrier = Arc::new(Barrier::new(
        pool.clone(),
        settings.unseal.shares,
        settings.unseal.threshold,
    ));
    let algorithm = match jose_core::SignatureAlgorithm::parse(&settings.signing.algorithm) {
        Ok(algorithm) => algorithm,
        Err(_) => {
            error!(algorithm = %settings.signing.algorithm, "invalid signing algorithm");
            return ExitCode::from(1);
        }
    };
    let keystore = Arc::new(SigningKeystore::new(pool.clone(), barrier.clone(), algorithm));
    let sink = BufferedSink::spawn(settings.telemetry.buffer_size);

    let (state, mut shutdown_rx) = AppState::new(
        settings.clone(),
        pool,
        barrier.clone(),
        keystore,
        sink,
    );

    let _jobs = jobs::spawn_all(&state);
    let _migration = spawn_legacy_secret_migration(state.clone());

    let (stop_tx, stop_rx) = watch::channel(false);
    let public_router = http::public_router(state.clone());
    let admin_router = http::admin_router(state.clone());

    let public_addr = settings.public_addr();
    let admin_addr = settings.admin_addr();
    let tls = settings.public_listener.tls.clone();
    let mut public_task = tokio::spawn({
        let stop_rx = stop_rx.clone();
        async move { http::serve(&public_addr, public_router, tls.as_ref(), stop_rx).await }
    });
    let mut admin_task = tokio::spawn({
        let stop_rx = stop_rx.clone();
        async move { http::serve(&admin_addr, admin_router, None, stop_rx).await }
    });

    info!(
        public = %settings.public_addr(),
        admin = %settings.admin_addr(),
        "listeners starting; service is sealed until unseal completes"
    );

    // Run until an exit condition fires.
    let outcome = tokio::select! {
        reason = shutdown_rx.recv() => match reason {
            Some(ShutdownReason::Integrity) => Outcome::Integrity,
            _ => Outcome::Clean,
        },
        _ = shutdown_signal() => Outcome::Clean,
        _ = unseal_timeout(barrier.clone(), settings.unseal.timeout_secs) => {
            error!("unseal did not complete within the configured timeout");
            Outcome::UnsealTimeout
        }
        result = &mut public_task => {
            report_listener_exit("public", result);
            let _ = stop_tx.send(true);
            admin_task.abort();
            return ExitCode::from(1);
        }
        result = &mut admin_task => {
            report_listener_exit("admin", result);
            let _ = stop_tx.send(true);
            public_task.abort();
            return ExitCode::from(1);
        }
    };

    // Graceful drain: stop accepting, bounded wait for in-flight work.
    let _ = stop_tx.send(true);
    let drain = async {
        let _ = (&mut public_task).await;
        let _ = (&mut admin_task).await;
    };
    if tokio::time::timeout(Duration::from_secs(30), drain).await.is_err() {
        warn!("listener drain exceeded deadline");
        public_task.abort();
        admin_task.abort();
    }

    state.barrier.seal().await;
    info!("keystone service shutdown complete");

    match outcome {
        Outcome::Clean => ExitCode::from(0),
        Outcome::UnsealTimeout => ExitCode::from(2),
        Outcome::Integrity => ExitCode::from(3),
    }
}

enum Outcome {
    Clean,
    UnsealTimeout,
    Integrity,
}

fn report_listener_exit(
    name: &str,
    result: std::result::Result<anyhow::Result<()>, tokio::task::JoinError>,
) {
    match result {
        Ok(Ok(())) => warn!(listener = name, "listener exited unexpectedly"),
        Ok(Err(err)) => error!(listener = name, error = %err, "listener failed"),
        Err(err) => error!(listener = name, error = %err, "listener task panicked"),
    }
}

/// Resolve once the unseal window has elapsed while still sealed; pends
/// forever otherwise.
async fn unseal_timeout(barrier: Arc<Barrier>, timeout_secs: Option<u64>) {
    match timeout_secs {
        None => std::future::pending().await,
        Some(secs) => {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            if barrier.is_unsealed().await {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Hash any legacy plaintext client secrets once the barrier opens; the
/// plaintext column is nulled in the same statement. `client_secret_jwt`
/// clients keep a barrier-sealed copy, which is why this waits for unseal.
fn spawn_legacy_secret_migration(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if state.barrier.is_unsealed().await {
                match migrate_legacy_secrets(&state).await {
                    Ok(0) => {}
                    Ok(migrated) => info!(migrated, "hashed legacy client secrets"),
                    Err(err) => warn!(error = %err, "legacy secret migration failed"),
                }
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    })
}

async fn migrate_legacy_secrets(state: &AppState) -> keystone_service::Result<usize> {
    let legacy = db::clients::list_with_legacy_secret(&state.pool).await?;
    let count = legacy.len();
    for (id, secret, method) in legacy {
        let to_hash = secret.clone();
        let hashed = tokio::task::spawn_blocking(move || password::hash_password(&to_hash))
            .await
            .map_err(|_| {
                keystone_service::ServiceError::Internal("hashing task failed".into())
            })??;
        let encrypted_copy = if method == "client_secret_jwt" {
            Some(
                state
                    .barrier
                    .encrypt_content(id.as_bytes(), secret.as_bytes())
                    .await?,
            )
        } else {
            None
        };
        db::clients::store_hashed_secret(
            &state.pool,
            &id,
            &hashed,
            encrypted_copy.as_deref(),
            keystone_service::clock::now_nanos(),
        )
        .await?;
    }
    Ok(count)
}

async fn health(settings: &Settings) -> ExitCode {
    let url = format!("http://{}/admin/livez", settings.admin_addr());
    match reqwest::get(&url).await {
        Ok(response) if response.status().is_success() => {
            println!("ok");
            ExitCode::from(0)
        }
        Ok(response) => {
            eprintln!("unhealthy: {}", response.status());
            ExitCode::from(1)
        }
        Err(err) => {
            eprintln!("unreachable: {err}");
            ExitCode::from(1)
        }
    }
}

async fn remote_shutdown(settings: &Settings) -> ExitCode {
    let url = format!("http://{}/admin/shutdown", settings.admin_addr());
    let client = reqwest::Client::new();
    let mut request = client.post(&url);
    if let Some(token) = &settings.admin_listener.token {
        request = request.header("x-admin-token", token);
    }
    match request.send().await {
        Ok(response) if response.status().is_success() => {
            println!("shutdown requested");
            ExitCode::from(0)
        }
        Ok(response) => {
            eprintln!("shutdown refused: {}", response.status());
            ExitCode::from(1)
        }
        Err(err) => {
            eprintln!("unreachable: {err}");
            ExitCode::from(1)
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C signal");
        },
        _ = terminate => {
            info!("received SIGTERM signal");
        },
    }

    info!("shutting down gracefully...");
}
