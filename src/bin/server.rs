//! collab-core server binary.
//!
//! Boots the WebSocket hub, the write-through repository stack, the
//! flusher, and the cleanup sweep, then serves the gateway and the
//! paste-lock REST gate over axum.
//!
//! # Environment Variables
//!
//! - `PORT` — HTTP/WS port (default: 8080)
//! - `DATABASE_URL` — PostgreSQL connection string (required)
//! - `REDIS_URL` — Redis connection string (required)
//! - `JWT_SECRET` — HS256 secret for gateway authentication (required)
//! - `ENVIRONMENT` — `production` or `development` (default: development)
//! - `ALLOWED_ORIGINS` — comma-separated origins allowed in production
//! - `FLUSH_INTERVAL_SECS`, `CLEANUP_INTERVAL_SECS`, `SESSION_INACTIVITY_SECS`
//! - `LSH_BANDS`, `LSH_HAMMING_THRESHOLD`
//! - `MAX_USER_CONNECTIONS`, `MAX_IP_CONNECTIONS`
//! - `RUST_LOG` — tracing filter (default: "info,collab_core=debug")

use std::net::SocketAddr;
use std::sync::Arc;

use collab_core::cleanup::CleanupService;
use collab_core::config::AppConfig;
use collab_core::flusher::Flusher;
use collab_core::hub::Hub;
use collab_core::kv::RedisKvStore;
use collab_core::lock::RedisLockStore;
use collab_core::paste::{Detector, NullValidator};
use collab_core::repo::{BufferedRepository, PgSessionRepository};
use collab_core::server::{app_router, AppState};
use collab_core::simhash::InMemoryFingerprintStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,collab_core=debug".into()),
        )
        .init();

    let config = AppConfig::from_env()?;
    let bind_addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;

    tracing::info!("connecting to Postgres");
    let pool = sqlx::PgPool::connect(&config.database_url).await?;
    let durable = PgSessionRepository::new(pool);
    durable.migrate().await?;

    tracing::info!("connecting to Redis");
    let redis_client = redis::Client::open(config.redis_url.clone())?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client).await?;
    let kv = RedisKvStore::new(redis_conn.clone());

    // `durable`/`kv` are cheap to clone (a pooled connection handle, a
    // connection-manager handle); the flusher gets its own clone so it
    // can write the durable store independently of the buffered
    // repository the hub talks to.
    let buffered: Arc<dyn collab_core::repo::SessionRepository> =
        Arc::new(BufferedRepository::new(durable.clone(), kv.clone()));
    let lock_store = Arc::new(RedisLockStore::new(redis_conn));
    let fingerprint_store = Arc::new(InMemoryFingerprintStore::new(
        config.lsh_bands,
        config.lsh_hamming_threshold,
    ));
    let detector = Arc::new(Detector::new(lock_store, Some(fingerprint_store), Some(Arc::new(NullValidator))));

    let (flusher, flush_trigger) = Flusher::new(Arc::new(durable.clone()), Arc::new(kv), config.flush_interval);

    let hub = Arc::new(Hub::new(
        Arc::clone(&buffered),
        Arc::clone(&detector),
        config.max_user_connections,
        config.max_ip_connections,
        Some(flush_trigger),
    ));

    let cleanup = CleanupService::new(
        Arc::clone(&buffered),
        Arc::clone(&hub),
        config.cleanup_interval,
        config.session_inactivity,
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let flusher_task = tokio::spawn(flusher.run(shutdown_rx));
    tokio::spawn(cleanup.run());

    let state = AppState {
        hub: Arc::clone(&hub),
        repo: buffered,
        detector,
        config: Arc::new(config),
    };
    let app = app_router(state);

    tracing::info!("collab-core server starting on {bind_addr}");
    tracing::info!("  GET  /health                      — liveness probe");
    tracing::info!("  GET  /ws                           — session join (WebSocket upgrade)");
    tracing::info!("  POST /api/sessions/{{id}}/ai/check  — paste-lock gate");

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    let shutdown_hub = Arc::clone(&hub);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Announce and close every connection so axum's graceful
            // shutdown (which waits for in-flight connections to end)
            // actually converges instead of waiting on sockets we never
            // close ourselves.
            shutdown_hub.shutdown("server restarting").await;
        })
        .await?;

    let _ = shutdown_tx.send(());
    let _ = flusher_task.await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
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
