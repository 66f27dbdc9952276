use axum::{http::header, response::IntoResponse, routing::get, serve, Extension, Router};
use clap::{Arg, ArgAction, Command};
use prometheus_client::{encoding::text::encode, registry::Registry};
use std::{
    error::Error,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};
use tokio::sync::mpsc;
use tracing::{error, info};
use turnstone_node::{echo, Config, Node};
use turnstone_transport::Manager;

const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

async fn metrics(Extension(registry): Extension<Arc<Registry>>) -> impl IntoResponse {
    let mut body = String::new();
    if let Err(err) = encode(&mut body, &registry) {
        error!(?err, "failed to encode metrics");
    }
    ([(header::CONTENT_TYPE, CONTENT_TYPE)], body)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Parse arguments
    let matches = Command::new("turnstone")
        .about("serve relay ports over tcp, udp, and tls")
        .arg(Arg::new("config").long("config").required(true))
        .arg(
            Arg::new("bind")
                .long("bind")
                .action(ArgAction::Append)
                .help("protocol:port to serve, e.g. udp:3478"),
        )
        .arg(
            Arg::new("metrics")
                .long("metrics")
                .value_parser(clap::value_parser!(u16))
                .help("port to serve metrics on"),
        )
        .arg(
            Arg::new("echo")
                .long("echo")
                .action(ArgAction::SetTrue)
                .help("send every received payload back to its sender"),
        )
        .get_matches();

    // Load config
    let config_file = matches.get_one::<String>("config").ok_or("missing config")?;
    let config: Config = serde_yaml::from_str(&std::fs::read_to_string(config_file)?)?;
    let ports = config.ports(
        matches
            .get_many::<String>("bind")
            .into_iter()
            .flatten()
            .map(String::as_str),
    )?;

    // Create logger
    tracing_subscriber::fmt()
        .json()
        .with_max_level(config.level()?)
        .with_line_number(true)
        .with_file(true)
        .init();
    info!(?ports, "loaded config");

    // Create manager
    let mut registry = Registry::default();
    let (echo_tx, echo_rx) = mpsc::unbounded_channel();
    let node = Node::new(matches.get_flag("echo").then_some(echo_tx), &mut registry);
    let manager = Arc::new(Manager::new(
        config.transport.clone(),
        Arc::new(node),
        &mut registry,
    )?);
    let echoer = tokio::spawn(echo(manager.clone(), echo_rx));

    // Serve metrics
    let registry = Arc::new(registry);
    if let Some(port) = matches.get_one::<u16>("metrics").copied() {
        let address = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let listener = tokio::net::TcpListener::bind(address).await?;
        let app = Router::new()
            .route("/metrics", get(metrics))
            .layer(Extension(registry.clone()));
        tokio::spawn(async move {
            if let Err(err) = serve(listener, app.into_make_service()).await {
                error!(?err, "metrics server failed");
            }
        });
        info!(%address, "serving metrics");
    }

    // Start servers
    for port in ports {
        manager.bind(port).await?;
    }
    manager.start(false).await?;
    info!(servers = ?manager.servers(), "running");

    // Run until interrupted
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    manager.stop().await;
    echoer.abort();
    Ok(())
}
