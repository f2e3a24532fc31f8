//! Router assembly and the serve loop.

use axum::{
    Router,
    http::{HeaderName, HeaderValue, Method, header},
    middleware::{from_fn, from_fn_with_state},
    routing::get,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{error, info, warn};

use crate::backend::{HttpUserService, MockUserService, UserService};
use crate::cache::{CacheStore, MemoryStore, RedisStore, ResponseCache};
use crate::config::{Args, CacheBackend, CacheSettings};
use crate::error::Result;
use crate::handlers::{
    create_user, delete_user, get_user, health_handler, list_users, metrics_handler, update_user,
};
use crate::middleware::{log_requests, recover_panics};
use crate::pipeline::GatewayPipeline;
use crate::registry::ClientRegistry;
use crate::state::AppState;

const CORS_MAX_AGE: Duration = Duration::from_secs(12 * 60 * 60);

/// Business routes behind the gateway pipeline, `/metrics` beside it.
///
/// Layers from the outside in: CORS, panic recovery, request logging,
/// admission control, response cache.
pub fn build_router(state: Arc<AppState>, pipeline: &GatewayPipeline, cors: CorsLayer) -> Router {
    let routes = Router::new()
        .route("/health", get(health_handler))
        .route("/api/users", get(list_users).post(create_user))
        .route(
            "/api/users/{id}",
            get(get_user).put(update_user).delete(delete_user),
        )
        .with_state(state);

    pipeline
        .apply(routes)
        .route("/metrics", get(metrics_handler))
        .layer(from_fn_with_state(pipeline.trusted_proxies(), log_requests))
        .layer(from_fn(recover_panics))
        .layer(cors)
}

pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::ORIGIN,
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::AUTHORIZATION,
            header::CACHE_CONTROL,
            HeaderName::from_static("if-none-match"),
        ])
        .expose_headers([header::CONTENT_LENGTH, header::ETAG])
        .allow_credentials(true)
        .max_age(CORS_MAX_AGE)
}

/// Build the response cache for the configured backend.
///
/// An unreachable Redis at startup is not fatal; the gateway then runs
/// without a cache.
pub async fn connect_cache(args: &Args, settings: CacheSettings) -> ResponseCache {
    if !settings.is_enabled() {
        info!("Response caching disabled");
        return ResponseCache::disabled();
    }

    let store: Arc<dyn CacheStore> = match args.cache_backend {
        CacheBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            store.start_purger(settings.ttl.max(Duration::from_secs(1)));
            store
        }
        CacheBackend::Redis => match RedisStore::connect(&args.redis_url).await {
            Ok(store) => Arc::new(store),
            Err(err) => {
                warn!(error = %err, "Redis unavailable, continuing without response cache");
                return ResponseCache::disabled();
            }
        },
    };

    info!(backend = ?args.cache_backend, ttl_secs = settings.ttl.as_secs(), "Response cache ready");
    ResponseCache::new(store, settings)
}

fn user_service(args: &Args) -> Result<Arc<dyn UserService>> {
    if args.user_service_mock {
        info!("Serving users from the built-in mock");
        return Ok(Arc::new(MockUserService::new()));
    }
    let service = HttpUserService::new(&args.user_service_url, args.user_service_timeout())?;
    info!(url = %args.user_service_url, "Forwarding to user service");
    Ok(Arc::new(service))
}

pub async fn run(args: Args) -> Result<()> {
    let rate_limit = args.rate_limit_settings()?;
    let cache_settings = args.cache_settings()?;

    let registry = Arc::new(ClientRegistry::from_settings(rate_limit));
    let sweeper = match registry.settings() {
        Some(settings) => {
            info!(
                burst_size = settings.burst_size,
                refill_per_second = settings.refill_per_second,
                "Rate limiting enabled"
            );
            Some(registry.start_sweeper(settings.cleanup_interval))
        }
        None => {
            warn!("Rate limiting disabled, every request is admitted");
            None
        }
    };

    let cache = connect_cache(&args, cache_settings).await;
    let pipeline = GatewayPipeline::new(registry, cache).with_trusted_proxies(args.trusted_proxies.clone());
    let state = Arc::new(AppState::new(user_service(&args)?));

    let app = build_router(state, &pipeline, cors_layer(&args.allow_origins()));

    let addr = args.listen_addr();
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Gateway listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
