use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum_server::Handle;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UnixListener};
use tokio::{signal, sync::watch};
use tracing::info;

use crate::config::ServerConfig;
use crate::func_config::FuncConfig;
use crate::gateway::Gateway;
use crate::grpc;
use crate::message_connection::run_ipc_listener;
use crate::metrics::{init_provider, GatewayMetrics};
use crate::routes::{create_routes, RouteState};
use crate::worker_manager::WorkerManager;

pub struct Service {
    pub config: ServerConfig,
}

impl Service {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    pub async fn start(&self) -> Result<()> {
        let _metrics_registry = init_provider();
        let metrics = GatewayMetrics::new();

        let func_config_json = std::fs::read_to_string(&self.config.func_config_file)
            .with_context(|| {
                format!(
                    "failed to read function config {}",
                    self.config.func_config_file
                )
            })?;
        let func_config =
            FuncConfig::load(&func_config_json).context("failed to load function config")?;
        info!(
            functions = func_config.entries().len(),
            "function config loaded"
        );

        let worker_manager = Arc::new(WorkerManager::new());
        let gateway = Arc::new(Gateway::new(
            func_config,
            func_config_json,
            &self.config,
            worker_manager,
            metrics,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(());

        // IPC endpoint for launcher/worker connections.
        let socket_path = self.config.gateway_socket_path();
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create ipc root {}", parent.display()))?;
        }
        if socket_path.exists() {
            std::fs::remove_file(&socket_path).with_context(|| {
                format!("failed to remove stale socket {}", socket_path.display())
            })?;
        }
        let ipc_listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("failed to bind {}", socket_path.display()))?;
        info!(path = %socket_path.display(), "listening for ipc connections");
        tokio::spawn(run_ipc_listener(
            ipc_listener,
            gateway.clone(),
            shutdown_rx.clone(),
        ));

        // Optional gRPC ingress.
        if let Some(grpc_addr) = self.config.grpc_addr()? {
            let listener = bind_tcp(grpc_addr, self.config.listen_backlog)?;
            listener.set_nonblocking(true)?;
            let listener = TcpListener::from_std(listener)?;
            info!(%grpc_addr, "listening for grpc requests");
            tokio::spawn(grpc::run_grpc_listener(
                listener,
                gateway.clone(),
                shutdown_rx.clone(),
            ));
        }

        let handle = Handle::new();
        let handle_sh = handle.clone();
        let shutdown_tx_sh = shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh, shutdown_tx_sh).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let http_addr = self.config.http_addr()?;
        let http_listener = bind_tcp(http_addr, self.config.listen_backlog)?;
        http_listener.set_nonblocking(true)?;
        info!(%http_addr, "listening for http requests");
        let routes = create_routes(RouteState {
            gateway,
            server_handle: handle.clone(),
            shutdown_tx,
        });
        axum_server::from_tcp(http_listener)
            .handle(handle)
            .serve(routes.into_make_service())
            .await?;
        info!("server stopped");

        cleanup_socket(&socket_path);
        Ok(())
    }
}

fn bind_tcp(addr: SocketAddr, backlog: i32) -> Result<std::net::TcpListener> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("failed to bind {addr}"))?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

fn cleanup_socket(path: &Path) {
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
}

async fn shutdown_signal(handle: Handle, shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    handle.graceful_shutdown(Some(std::time::Duration::from_secs(30)));
    let _ = shutdown_tx.send(());
}
