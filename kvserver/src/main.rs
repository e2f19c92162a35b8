//! Service entry point: configuration, server bootstrap, shutdown.

mod config;
mod consensus;
mod error;
mod kv;
mod kv_service;
mod metrics;
mod raft_client;
mod raft_service;
mod server;

use clap::Parser;
use tokio::signal;

use crate::error::KvError;
use crate::kv_service::pb::kv_service_server::KvServiceServer;
use crate::kv_service::KvServiceSVC;
use crate::raft_service::pb::raft_service_server::RaftServiceServer;
use crate::raft_service::RaftServiceSVC;

/// Resolves when Ctrl+C or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short = 'c', long = "config", default_value_t = String::from("./config/config.toml"))]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), KvError> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();
    let config = config::RuntimeConfig::from_toml(&args.config)?;

    let server = server::KvServer::start(&config)?;

    if config.metrics_port > 0 {
        metrics::init_registry();
        metrics::start_metrics_server(config.metrics_port);
    }

    let addr = format!("0.0.0.0:{}", config.listen_port())
        .parse()
        .map_err(|e| KvError::runtime("parse listen address", e))?;
    let grpc_server = tonic::transport::Server::builder()
        .add_service(RaftServiceServer::new(RaftServiceSVC::new(
            server.in_mailbox.clone(),
        )))
        .add_service(KvServiceServer::new(KvServiceSVC::new(server.clone())))
        .serve(addr);
    tokio::spawn(async move {
        if let Err(e) = grpc_server.await {
            log::error!("grpc server terminated: {}", e);
        }
    });
    log::info!(
        "kv server {} started, serving on port {}",
        config.me,
        config.listen_port()
    );

    shutdown_signal().await;
    log::info!("kv server {} stopped", config.me);
    Ok(())
}
