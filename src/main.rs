use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use auto_reply::channels::{
    AccountDirectory, AdapterRegistry, GraphTransport, LogNotifier, OperatorNotifier, Outbound,
    TelegramNotifier,
};
use auto_reply::config::AppConfig;
use auto_reply::escalation::Escalator;
use auto_reply::gateway::ConversationGateway;
use auto_reply::llm::create_provider;
use auto_reply::pipeline::classifier::IntentClassifier;
use auto_reply::pipeline::composer::ReplyComposer;
use auto_reply::pipeline::{Reconciler, ReplyServices, build_reply_pipeline, spawn_reconciler};
use auto_reply::stats::StatsRecorder;
use auto_reply::store::{Database, LibSqlBackend};
use auto_reply::webhook::{WebhookState, stats_routes, webhook_routes};

/// Stderr logging, plus a daily-rotated file when `log_dir` is set.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "auto-reply.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("Auto Reply v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.llm.model);
    eprintln!("   Webhook: http://0.0.0.0:{}/webhook", config.webhook_port);
    eprintln!("   Auto-reply: {}", if config.auto_reply_enabled { "on" } else { "off" });

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Accounts & transports ────────────────────────────────────────────
    let accounts = Arc::new(match &config.accounts_file {
        Some(path) => AccountDirectory::load(path)?,
        None => {
            tracing::warn!("AUTO_REPLY_ACCOUNTS_FILE not set; no accounts configured");
            AccountDirectory::default()
        }
    });
    eprintln!("   Accounts: {}", accounts.all().len());

    let mut registry = AdapterRegistry::new();
    registry
        .register(Arc::new(GraphTransport::new("facebook")))
        .register(Arc::new(GraphTransport::new("instagram")));
    tracing::info!(platforms = ?registry.platforms(), "Transports registered");
    let outbound = Outbound::new(Arc::new(registry), Arc::new(accounts.credential_store()));

    let notifier: Arc<dyn OperatorNotifier> = match &config.telegram {
        Some(telegram) => Arc::new(TelegramNotifier::new(telegram)),
        None => {
            tracing::warn!("No operator channel configured; escalations are only logged");
            Arc::new(LogNotifier)
        }
    };

    let escalator = Escalator::new(notifier);

    // ── Pipeline ─────────────────────────────────────────────────────────
    let llm = create_provider(&config.llm)?;
    let stats = StatsRecorder::new(Arc::clone(&db));
    let services = ReplyServices {
        gateway: ConversationGateway::new(Arc::clone(&db)),
        classifier: Arc::new(IntentClassifier::new(&config.reply.rules)),
        composer: Arc::new(ReplyComposer::new(Arc::clone(&db), llm, config.reply.clone())),
        outbound: outbound.clone(),
        escalator: escalator.clone(),
        stats: stats.clone(),
        accounts: Arc::clone(&accounts),
        auto_reply_enabled: config.auto_reply_enabled,
    };
    let pipeline = Arc::new(build_reply_pipeline(services)?);
    tracing::info!(stages = ?pipeline.stage_names(), "Reply pipeline ready");

    // ── Reconciliation sweep ─────────────────────────────────────────────
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&accounts),
        outbound,
        Arc::clone(&pipeline),
        escalator,
        config.sweep.clone(),
    ));
    let (sweep_handle, sweep_shutdown) = spawn_reconciler(reconciler, config.sweep.interval);

    // ── Webhook server ───────────────────────────────────────────────────
    let app = webhook_routes(WebhookState {
        pipeline,
        accounts,
        verify_token: config.verify_token.clone(),
    })
    .merge(stats_routes(stats))
    .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.webhook_port))
        .await
        .with_context(|| format!("failed to bind port {}", config.webhook_port))?;
    tracing::info!(port = config.webhook_port, "Webhook server started");

    let shutdown = sweep_shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutting down");
            shutdown.cancel();
        })
        .await?;

    sweep_shutdown.cancel();
    if let Err(e) = sweep_handle.await {
        tracing::error!(error = %e, "Sweep task ended abnormally");
    }
    Ok(())
}
