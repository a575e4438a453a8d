use std::sync::Arc;

use nudge_common::config::AppConfig;
use nudge_common::db;
use nudge_engine::channels::ChannelRegistry;
use nudge_engine::history::HistoryLog;
use nudge_engine::locks::UserLocks;
use nudge_engine::store::{InMemoryUserStore, PgUserStore, UserStore};
use nudge_notifier::dispatcher::{DispatchConfig, Dispatcher};
use nudge_notifier::gateway;
use nudge_scheduler::jobs;
use nudge_scheduler::scheduler::Scheduler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "nudge_scheduler=info,nudge_notifier=info,nudge_engine=info".into()
            }),
        )
        .json()
        .init();

    tracing::info!("Nudge scheduler starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // User store
    let store: Arc<dyn UserStore> = match &config.database_url {
        Some(url) => {
            let pool = db::create_pool(url, config.db_max_connections).await?;
            sqlx::migrate!("../../migrations").run(&pool).await?;
            tracing::info!("Database migrations applied");
            Arc::new(PgUserStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory user store");
            Arc::new(InMemoryUserStore::new())
        }
    };

    // Delivery pipeline
    let push = gateway::connect(config.gateway())?;
    let locks = Arc::new(UserLocks::new());
    let channels = Arc::new(ChannelRegistry::new(store.clone(), locks.clone()));
    let history = Arc::new(HistoryLog::new(store.clone(), locks));
    let dispatcher = Arc::new(Dispatcher::new(
        push,
        store,
        channels,
        history,
        DispatchConfig::from_app_config(&config)?,
    ));

    let scheduler = Scheduler::new(dispatcher);
    if config.scheduler_default_jobs {
        jobs::register_default_jobs(&scheduler).await?;
    }
    scheduler.start().await;

    let status = scheduler.status().await;
    tracing::info!(jobs = ?status.job_names, "Scheduler running");

    // Run until Ctrl+C
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping gracefully...");

    scheduler.stop().await;
    tracing::info!("Nudge scheduler stopped.");
    Ok(())
}
