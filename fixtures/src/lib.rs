use axum::Router;
use clap::Parser;
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;
use tracing::info;

pub mod blob_store;

/// Common CLI arguments for all fixture servers
#[derive(Parser, Debug, Clone)]
pub struct FixtureArgs {
    /// The port to listen on
    #[arg(short, long, default_value = "0")]
    pub port: u16,

    /// The host to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    pub host: String,
}

/// Bind the listener first so the router can be built knowing its own address
pub async fn run_server<F>(args: FixtureArgs, build: F) -> anyhow::Result<()>
where
    F: FnOnce(SocketAddr) -> Router,
{
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let addr = format!("{}:{}", args.host, args.port).parse::<SocketAddr>()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;

    let app = build(local_addr).layer(TraceLayer::new_for_http());

    info!("Fixture server listening on {}", local_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Serve `build`'s router on an ephemeral localhost port in the background
///
/// Returns the base URL, e.g. `http://127.0.0.1:54321`.
pub async fn spawn_server<F>(build: F) -> anyhow::Result<String>
where
    F: FnOnce(SocketAddr) -> Router,
{
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let local_addr = listener.local_addr()?;
    let app = build(local_addr);

    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!("Fixture server on {} stopped: {}", local_addr, err);
        }
    });

    Ok(format!("http://{local_addr}"))
}
