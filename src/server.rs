use crate::config::Config;
use crate::error::ThrottlerResult;
use crate::handlers::{
    delete_rate_limit, get_metrics, get_rate_limit, health_check, reset_rate_limits, AppState,
};
use crate::middleware::rate_limit_middleware;
use crate::throttler::Throttler;
use axum::routing::{any, delete, get, post};
use axum::{middleware, Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the router: guarded application routes plus the unguarded admin
/// and health surface.
pub fn create_app(throttler: Arc<Throttler>) -> Router {
    let state = AppState::new(Arc::clone(&throttler));

    let guarded = Router::new()
        .route("/api", any(guarded_echo))
        .route("/api/*path", any(guarded_echo))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&throttler),
            rate_limit_middleware,
        ));

    let admin = Router::new()
        .route("/admin/rate-limit/:identifier", get(get_rate_limit))
        .route("/admin/rate-limit/:identifier", delete(delete_rate_limit))
        .route("/admin/reset", post(reset_rate_limits))
        .route("/admin/metrics", get(get_metrics))
        .route("/health", get(health_check))
        .with_state(state);

    admin.merge(guarded).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    )
}

/// Placeholder upstream for the demo server: reports that the request got through.
async fn guarded_echo(uri: axum::http::Uri) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "path": uri.path(),
    }))
}

pub struct Server {
    throttler: Arc<Throttler>,
    bind_addr: SocketAddr,
}

impl Server {
    pub fn new(config: &Config) -> ThrottlerResult<Self> {
        let throttler = Arc::new(Throttler::new(config)?);
        Ok(Self {
            throttler,
            bind_addr: config.bind_addr,
        })
    }

    pub fn throttler(&self) -> Arc<Throttler> {
        Arc::clone(&self.throttler)
    }

    /// Serve until a shutdown signal arrives. The sweeper is started first and
    /// state is released on every exit path, including bind and serve errors.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        self.throttler.start_cleanup()?;

        let served = self.serve().await;
        if let Err(err) = &served {
            tracing::error!("Server stopped with error: {}", err);
        }

        self.throttler.destroy()?;
        tracing::info!("Rate limit state released");

        served
    }

    async fn serve(&self) -> Result<(), Box<dyn std::error::Error>> {
        let app = create_app(Arc::clone(&self.throttler));
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        tracing::info!("Throttle guard listening on {}", self.bind_addr);
        tracing::info!("Health check available at /health");
        tracing::info!("Admin endpoints available under /admin");

        // Run server with graceful shutdown
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
