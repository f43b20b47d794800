use std::sync::Arc;

use anyhow::Context;
use task_dispatch::api::{AppState, dispatch_routes};
use task_dispatch::channels::{
    BroadcastNotifier, CompletionChannel, HttpCompletionChannel, MemoryCompletionChannel,
    PassthroughPayloadResolver,
};
use task_dispatch::config::DispatchConfig;
use task_dispatch::dispatch::{
    Collaborators, DispatchService, spawn_dispatch_sweep, spawn_sync_reconciler,
};
use task_dispatch::eligibility::InMemoryWorkerDirectory;
use task_dispatch::store::LibSqlLedger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = DispatchConfig::from_env();
    config.validate()?;

    eprintln!("Task Dispatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   API: http://0.0.0.0:{}/api", config.bind_port);
    eprintln!("   Worker stream: ws://0.0.0.0:{}/stream/worker/{{account_id}}", config.bind_port);

    let ledger = Arc::new(
        LibSqlLedger::new_local(&config.db_path)
            .await
            .context("opening task ledger")?,
    );

    let completion: Arc<dyn CompletionChannel> = match &config.completion_url {
        Some(url) => {
            eprintln!("   Completions: {url}");
            Arc::new(HttpCompletionChannel::new(
                url.clone(),
                config.completion_token.clone(),
            ))
        }
        None => {
            eprintln!("   Completions: in-process only");
            Arc::new(MemoryCompletionChannel::new())
        }
    };

    let directory = Arc::new(InMemoryWorkerDirectory::new(config.worker_presence_window));
    let notifier = Arc::new(BroadcastNotifier::new());
    let service = Arc::new(DispatchService::new(
        config.clone(),
        Collaborators {
            ledger,
            directory: directory.clone(),
            notifier: notifier.clone(),
            completion,
            resolver: Arc::new(PassthroughPayloadResolver),
        },
    ));

    let _reconciler = spawn_sync_reconciler(service.sync_bridge(), config.sync_reconcile_interval);
    let _sweep = spawn_dispatch_sweep(Arc::clone(&service), config.sweep_interval);

    let app = dispatch_routes(AppState {
        service,
        directory,
        notifier,
    });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.bind_port))
        .await
        .with_context(|| format!("binding port {}", config.bind_port))?;
    tracing::info!(port = config.bind_port, "Dispatch server started");
    axum::serve(listener, app).await?;

    Ok(())
}
