use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::{Server, ServerTlsConfig};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use zsilo_api::zsilo::v1::service_server::ServiceServer;
use zsilo_api::zsilo::v1::volume_service_server::VolumeServiceServer;
use zsilo_core::cmd::iscsi::{Credentials, Host};
use zsilo_core::exec::{ConsumerMap, LocalExecutor, RemoteConfig, RemoteExecutor};
use zsilo_core::{SharedExecutor, VolumeManager, VolumeStore};

mod api;
mod auth;
mod config;
mod proto_convert;
mod tls;

use api::server::{SiloServiceImpl, VolumeServiceImpl};
use auth::AuthInterceptor;
use config::{Config, TargetConfig, TargetType};

#[derive(Parser)]
#[command(name = "zsilod")]
#[command(about = "zsilo storage control plane daemon", long_about = None)]
struct Cli {
    /// Path to the JSON config file, or `-` to read it from stdin
    #[arg(short, long)]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    init_tracing(&config.log)?;
    info!("zsilod starting");

    let store = VolumeStore::new(&config.database.dsn).await?;

    let producer = build_executor(&config.command.produce_target);
    let mut consumers = ConsumerMap::new();
    for consume in &config.command.consume_targets {
        consumers.insert(consume.iqn.clone(), build_executor(&consume.target));
    }
    info!("configured {} consumer target(s)", consumers.len());

    let host = Host::new(
        &config.command.host.domain,
        config.command.host.owner_time,
        &config.command.host.hostname,
    );
    let credentials = Credentials {
        user_id: config.command.credentials.user_id.clone(),
        password: config.command.credentials.password.clone(),
        mutual_user_id: config.command.credentials.mutual_user_id.clone(),
        mutual_password: config.command.credentials.mutual_password.clone(),
    };

    let manager = Arc::new(VolumeManager::new(
        store,
        producer,
        consumers,
        host,
        credentials,
        &config.command.pool,
    ));

    let interceptor = AuthInterceptor::new(
        config
            .service
            .keys
            .iter()
            .map(|key| (key.identity.clone(), key.token.clone()))
            .collect(),
    );

    let addr: SocketAddr = config.service.bind_address.parse()?;

    let mut builder = if config.service.tls {
        let identity = tls::self_signed_identity(&config.command.host.hostname)?;
        Server::builder().tls_config(ServerTlsConfig::new().identity(identity))?
    } else {
        Server::builder()
    };

    info!("zsilod listening on {addr}");
    builder
        .add_service(ServiceServer::with_interceptor(
            SiloServiceImpl::new(Arc::clone(&manager)),
            interceptor.clone(),
        ))
        .add_service(VolumeServiceServer::with_interceptor(
            VolumeServiceImpl::new(Arc::clone(&manager)),
            interceptor,
        ))
        .serve_with_shutdown(addr, shutdown_signal())
        .await?;

    info!("zsilod shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("received shutdown signal");
    }
}

fn build_executor(target: &TargetConfig) -> SharedExecutor {
    match target.kind {
        TargetType::Local => Arc::new(LocalExecutor::new(target.run_as_root)),
        TargetType::Remote => Arc::new(RemoteExecutor::new(RemoteConfig {
            run_as_root: target.run_as_root,
            address: target.remote.address.clone(),
            port: target.remote.port,
            username: target.remote.username.clone(),
            password: target.remote.password.clone(),
        })),
    }
}

fn init_tracing(log: &config::LogConfig) -> anyhow::Result<()> {
    let level = match log.level.as_str() {
        "DEBUG" => tracing::Level::DEBUG,
        "INFO" => tracing::Level::INFO,
        "WARN" => tracing::Level::WARN,
        "ERROR" => tracing::Level::ERROR,
        other => anyhow::bail!("unsupported log level {other}"),
    };
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let registry = tracing_subscriber::registry().with(filter);
    if log.format == "JSON" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().with_target(true).with_level(true)).init();
    }
    Ok(())
}
