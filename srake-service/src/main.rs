mod error;
mod routes;
mod state;

use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use state::{AppState, SharedState};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Parser)]
#[command(name = "srake-service")]
#[command(about = "HTTP API over the srake metadata store")]
struct Args {
    /// Port to listen on
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Bind address
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Path to the metadata store (env: SRAKE_DB_PATH)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Allow cross-origin requests regardless of the config file
    #[arg(long)]
    cors: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("srake=info,tower_http=info")),
        )
        .init();

    let args = Args::parse();
    let config = srake_core::Config::load_default()?;
    let cors_enabled = args.cors || config.http.cors;
    let db_path = srake_core::paths::db_path(args.db.as_deref());

    let state: SharedState = Arc::new(AppState::new(&db_path, config)?);

    let api = Router::new()
        .route("/search", get(routes::search))
        .route("/studies/{accession}", get(routes::get_study))
        .route("/experiments/{accession}", get(routes::get_experiment))
        .route("/samples/{accession}", get(routes::get_sample))
        .route("/runs/{accession}", get(routes::get_run))
        .route("/stats", get(routes::stats))
        .route("/aggregations/{field}", get(routes::aggregations))
        .route("/export", post(routes::export))
        .route("/health", get(routes::health));

    let mut app = Router::new()
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // CORS is opt-in
    if cors_enabled {
        app = app.layer(tower_http::cors::CorsLayer::permissive());
    }

    let addr = format!("{}:{}", args.bind, args.port);
    eprintln!("srake-service listening on {addr} (store: {})", db_path.display());

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
