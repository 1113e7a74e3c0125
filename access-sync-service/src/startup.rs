//! Application startup and lifecycle management.

use crate::config::{AccessSyncConfig, StoreBackend};
use crate::handlers;
use crate::middleware::require_admin_token;
use crate::services::codec::CodecKeys;
use crate::services::coordinator::{PublishCoordinator, PublishPipeline};
use crate::services::jobs;
use crate::services::{
    AccessPolicyEngine, AccessStore, ArtifactPublisher, ContentGenerator, GitDataPublisher,
    HttpUserLookup, InMemoryStore, MockPublisher, MongoStore, ThrottledClient, UserLookup,
    UsernameResolver,
};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::{
    routing::{get, post, put},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::metrics_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

const DEFAULT_PLAINTEXT_PATH: &str = "whitelist.txt";
const DEFAULT_ENCODED_PATH: &str = "whitelist.encoded.txt";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AccessSyncConfig>,
    pub store: Arc<dyn AccessStore>,
    pub policy: Arc<AccessPolicyEngine>,
    pub resolver: Arc<UsernameResolver>,
    pub coordinator: PublishCoordinator,
}

impl AppState {
    /// Wires the pipeline over the given backends and starts the publish
    /// driver. Must run inside a Tokio runtime.
    pub fn assemble(
        config: AccessSyncConfig,
        store: Arc<dyn AccessStore>,
        lookup: Arc<dyn UserLookup>,
        publisher: Arc<dyn ArtifactPublisher>,
    ) -> Self {
        let resolver = Arc::new(UsernameResolver::new(
            store.clone(),
            lookup,
            config.usernames.clone(),
        ));
        let policy = Arc::new(AccessPolicyEngine::new(store.clone()));
        let generator = Arc::new(ContentGenerator::new(store.clone(), resolver.clone()));

        let (plaintext_path, encoded_path) = match &config.publish.github {
            Some(github) => (github.plaintext_path.clone(), github.encoded_path.clone()),
            None => (
                DEFAULT_PLAINTEXT_PATH.to_string(),
                DEFAULT_ENCODED_PATH.to_string(),
            ),
        };
        let pipeline = PublishPipeline {
            generator,
            publisher,
            keys: CodecKeys::from_config(&config.codec),
            community_id: config.codec.publish_community_id.clone(),
            plaintext_path,
            encoded_path,
        };
        let coordinator = PublishCoordinator::spawn(
            policy.clone(),
            pipeline,
            config.publish.debounce,
            config.publish.retry_max_delay,
        );

        Self {
            config: Arc::new(config),
            store,
            policy,
            resolver,
            coordinator,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let admin = Router::new()
        .route(
            "/communities/:community_id/members/:identity_id",
            put(handlers::members::update_member).delete(handlers::members::remove_member),
        )
        .route(
            "/communities/:community_id/bans/:identity_id",
            post(handlers::members::ban_member),
        )
        .route(
            "/communities/:community_id/roles",
            get(handlers::roles::list_roles).post(handlers::roles::create_role),
        )
        .route(
            "/communities/:community_id/roles/:role_id",
            axum::routing::delete(handlers::roles::delete_role),
        )
        .route(
            "/identities/:identity_id/accounts/:account_id",
            put(handlers::identities::set_account_state),
        )
        .route(
            "/identities/:identity_id/grants",
            post(handlers::identities::create_grant),
        )
        .route(
            "/identities/:identity_id/grants/:role_id",
            axum::routing::delete(handlers::identities::revoke_grant),
        )
        .route("/whitelist", get(handlers::whitelist::preview))
        .route("/whitelist/publish", post(handlers::whitelist::publish))
        .route("/whitelist/decode", post(handlers::whitelist::decode))
        .layer(from_fn_with_state(state.clone(), require_admin_token));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .nest("/v1", admin)
        .layer(from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
    throttle: ThrottledClient,
    jobs: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl Application {
    pub async fn build(config: AccessSyncConfig) -> Result<Self, AppError> {
        let store: Arc<dyn AccessStore> = match (&config.store.backend, &config.store.mongodb) {
            (StoreBackend::MongoDb, Some(mongo)) => {
                let store = MongoStore::connect(&mongo.uri, &mongo.database).await?;
                store.initialize_indexes().await.map_err(|e| {
                    tracing::error!("Failed to initialize database indexes: {}", e);
                    e
                })?;
                Arc::new(store)
            }
            (StoreBackend::MongoDb, None) => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "MongoDB backend selected without connection settings"
                )));
            }
            (StoreBackend::Memory, _) => {
                tracing::warn!("Using in-memory store; state is lost on restart");
                Arc::new(InMemoryStore::new())
            }
        };

        let throttle = ThrottledClient::new(config.source_api.clone())?;
        let lookup: Arc<dyn UserLookup> = Arc::new(HttpUserLookup::new(
            throttle.clone(),
            config.source_api.base_url.clone(),
        ));

        let publisher: Arc<dyn ArtifactPublisher> = match &config.publish.github {
            Some(github) => {
                tracing::info!(
                    owner = %github.owner,
                    repo = %github.repo,
                    branch = %github.branch,
                    "Git data publisher initialized"
                );
                Arc::new(GitDataPublisher::new(github.clone())?)
            }
            None => {
                tracing::warn!("GitHub publishing not configured, using mock publisher");
                Arc::new(MockPublisher::new())
            }
        };

        let state = AppState::assemble(config.clone(), store.clone(), lookup, publisher);

        let shutdown = CancellationToken::new();
        let jobs = vec![
            jobs::spawn_username_refresh(
                state.resolver.clone(),
                state.coordinator.clone(),
                config.usernames.refresh_interval,
                shutdown.clone(),
            ),
            jobs::spawn_expiry_sweep(
                store,
                state.coordinator.clone(),
                config.publish.expiry_sweep_interval,
                shutdown.clone(),
            ),
        ];

        // Port 0 binds a random port for tests.
        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();
        tracing::info!("Access sync service listening on port {}", port);

        Ok(Self {
            port,
            listener,
            state,
            throttle,
            jobs,
            shutdown,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Serves until a shutdown signal, then stops the jobs, flushes any
    /// pending publish and closes the source API queue.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = build_router(self.state.clone());
        axum::serve(self.listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        self.shutdown.cancel();
        for job in self.jobs {
            if let Err(e) = job.await {
                tracing::error!(error = %e, "Maintenance job failed");
            }
        }
        self.state.coordinator.shutdown().await;
        self.throttle.shutdown();

        tracing::info!("Access sync service stopped");
        Ok(())
    }
}
