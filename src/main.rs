//! Process entry point: composition root construction and listener setup.
//!
//! Grounded on the teacher's own `main.rs` (dotenv -> config::init -> build
//! the `Service` -> ACME/QUIC-aware listener setup -> graceful shutdown on
//! SIGINT/SIGTERM), generalized to build `AppState` instead of calling
//! `crate::db::init()`, and to fall back to a plain HTTP listener when no
//! `tls` section is configured rather than the teacher's `todo!()`.

use std::sync::Arc;

use salvo::catcher::Catcher;
use salvo::conn::Acceptor;
use salvo::conn::rustls::{Keycert, RustlsConfig};
use salvo::prelude::*;
use salvo::server::ServerHandle;
use tokio::signal;
use tracing::info;

mod agent;
mod agent_cli;
mod app;
mod cache;
mod circuit;
mod config;
mod error;
mod errors;
mod health;
mod hoops;
mod memory;
mod pool;
mod prelude;
mod rate_limit;
mod routers;
mod session;
mod transport;
mod turn;
mod utils;
mod validate;

use crate::agent_cli::CliAgentFactory;
use crate::app::AppState;
use crate::config::{GatewayConfig, TlsConfig};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    crate::config::init();
    let config = crate::config::get();

    let _guard = config.log.guard();
    tracing::info!("log level: {}", &config.log.filter_level);

    let factory = Arc::new(CliAgentFactory::new(config.agent.clone()));
    let state = AppState::build(config, factory).await;

    let service = Service::new(routers::root(state)).catcher(Catcher::default());

    if let Some(tls) = &config.tls {
        let listen_addr = &config.listen_addr;
        let port = config.listen_https_port;
        println!(
            "gateway listening on https://{}:{port}/",
            listen_addr.replace("0.0.0.0", "127.0.0.1"),
        );
        println!(
            "openapi docs: https://{}:{port}/swagger-ui",
            listen_addr.replace("0.0.0.0", "127.0.0.1")
        );
        let acceptor = setup_acceptor_socket(config, tls).await;
        let server = Server::new(acceptor);
        tokio::spawn(shutdown_signal(server.handle()));
        server.serve(service).await;
    } else {
        let listen_addr = &config.listen_addr;
        let port = config.listen_http_port;
        println!("gateway listening on http://{listen_addr}:{port}/ (no tls configured)");
        let acceptor = TcpListener::new((listen_addr.as_str(), port)).bind().await;
        let server = Server::new(acceptor);
        tokio::spawn(shutdown_signal(server.handle()));
        server.serve(service).await;
    }
}

async fn setup_acceptor_socket(cfg: &GatewayConfig, tls: &TlsConfig) -> impl Acceptor {
    let (cert, key) = tokio::join!(tokio::fs::read(&tls.cert), tokio::fs::read(&tls.key));
    let cert = cert.expect("valid cert.pem path must be provided");
    let key = key.expect("valid key.pem path must be provided");
    let rustls_config = RustlsConfig::new(Keycert::new().cert(cert).key(key));
    let http = TcpListener::new((cfg.listen_addr.as_str(), cfg.listen_http_port));
    let https =
        TcpListener::new((cfg.listen_addr.as_str(), cfg.listen_https_port)).rustls(rustls_config.clone());
    let http3 = QuinnListener::new(rustls_config, (cfg.listen_addr.as_str(), cfg.listen_https_port));
    let acceptor = http3.join(https).join(http).bind().await;
    info!(
        "server running on https://{}:{}/",
        cfg.listen_addr, cfg.listen_https_port
    );
    acceptor
}

async fn shutdown_signal(handle: ServerHandle) {
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
        _ = ctrl_c => info!("ctrl_c signal received"),
        _ = terminate => info!("terminate signal received"),
    }
    handle.stop_graceful(std::time::Duration::from_secs(60));
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use salvo::test::TestClient;

    use crate::agent::scripted::ScriptedAgentFactory;
    use crate::app::AppState;
    use crate::config;

    #[tokio::test]
    async fn health_endpoint_reports_ok_status() {
        config::init();
        let state = AppState::build(config::get(), Arc::new(ScriptedAgentFactory(|| Vec::new()))).await;
        let service = Service::new(crate::routers::root(state));

        let status = TestClient::get(format!(
            "http://{}/api/health",
            config::get().listen_addr.replace("0.0.0.0", "127.0.0.1")
        ))
        .send(&service)
        .await
        .status_code;

        assert_eq!(status, Some(salvo::http::StatusCode::OK));
    }
}
