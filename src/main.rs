use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use autoreply::config::AppConfig;
use autoreply::pipeline::{AutoReplyOrchestrator, OutboundDispatcher, WebhookReceiver};
use autoreply::providers::{create_ai_provider, create_messaging_provider};
use autoreply::routes::{AppState, app_routes};
use autoreply::store::{ConversationStore, LibSqlBackend};

/// Upper bound on waiting for in-flight replies at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(120);

/// Stale `pending` deliveries picked up at startup.
const RESUME_LIMIT: usize = 500;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("Invalid configuration")?;

    // Initialize tracing; keep the guard alive so buffered file logs are flushed on exit
    let (file_layer, _log_guard) = match &config.server.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "autoreply.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    eprintln!("📨 Autoreply v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Listening: http://{}", config.server.bind);
    eprintln!("   Database: {}", config.server.db_path.display());
    eprintln!("   AI: {:?} ({})", config.ai.backend, config.ai.model);
    eprintln!("   Reply mode: {:?}\n", config.reply.mode);

    let store: Arc<dyn ConversationStore> = Arc::new(
        LibSqlBackend::new_local(&config.server.db_path)
            .await
            .context("Failed to open database")?,
    );

    let messaging = create_messaging_provider(&config.messaging)?;
    let ai = create_ai_provider(&config.ai)?;

    let dispatcher = Arc::new(OutboundDispatcher::new(
        Arc::clone(&messaging),
        Arc::clone(&store),
        &config.dispatch,
    ));
    let orchestrator = Arc::new(AutoReplyOrchestrator::new(
        Arc::clone(&store),
        ai,
        Arc::clone(&dispatcher),
        Arc::new(config.tag_rules.clone()),
        config.reply.clone(),
    ));
    match dispatcher.resume_pending(RESUME_LIMIT).await {
        Ok(0) => {}
        Ok(n) => tracing::info!(resumed = n, "Resumed pending deliveries"),
        Err(e) => tracing::error!(error = %e, "Failed to resume pending deliveries"),
    }

    let receiver = Arc::new(WebhookReceiver::new(
        Arc::clone(&store),
        messaging,
        orchestrator,
        config.server.dedup_bucket,
        config.reply.mode,
    ));

    tracing::info!(
        rules = config.tag_rules.len(),
        organization = %config.server.default_organization,
        operator_auth = config.server.operator_token.is_some(),
        "Pipeline ready"
    );

    let app = app_routes(AppState {
        receiver: Arc::clone(&receiver),
        store,
        dispatcher,
        default_organization: config.server.default_organization.clone(),
        operator_token: config.server.operator_token.clone(),
    });

    let listener = tokio::net::TcpListener::bind(config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    tracing::info!(addr = %config.server.bind, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await
        .context("HTTP server failed")?;

    if tokio::time::timeout(SHUTDOWN_GRACE, receiver.drain())
        .await
        .is_err()
    {
        tracing::warn!(
            in_flight = receiver.in_flight(),
            "Shutdown grace period elapsed, abandoning replies"
        );
    }

    Ok(())
}
