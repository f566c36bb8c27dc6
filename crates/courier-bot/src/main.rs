//! Courier entry point: load config, build the process-scoped context,
//! start the background flush/replay tasks, and drive the Telegram
//! dispatcher until shutdown.

use std::sync::Arc;
use std::time::Duration;

use teloxide::Bot;
use tracing::info;
use tracing_subscriber::EnvFilter;

use courier_agent::anthropic::AnthropicProvider;
use courier_agent::files_api::FilesApiClient;
use courier_agent::sandbox::SandboxClient;
use courier_agent::tools::ToolRegistry;
use courier_agent::transcription::TranscriptionClient;
use courier_cache::{CacheClient, WriteQueue};
use courier_core::config::{self, CourierConfig};
use courier_core::metrics::Metrics;
use courier_core::Usd;
use courier_store::{flush, BalancePolicy, BalanceService, Database};
use courier_telegram::generation::GenerationTracker;
use courier_telegram::handler::run_dispatcher;
use courier_telegram::limiter::UserConcurrencyLimiter;
use courier_telegram::uploads::UploadTracker;
use courier_telegram::{AppContext, MessageQueueManager};

#[tokio::main]
async fn main() -> courier_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args().nth(1);
    let config = CourierConfig::load(config_path.as_deref())?;
    info!(model = %config.anthropic.default_model, "courier starting");

    let metrics = Arc::new(Metrics::new());
    let cache = Arc::new(CacheClient::connect(&config.cache, Arc::clone(&metrics)).await?);
    let db = Arc::new(Database::open(&config.database.path)?);
    let write_queue = Arc::new(WriteQueue::new(Arc::clone(&cache)));

    let api_key = config::read_secret_file(&config.anthropic.api_key_file)?;
    let provider: Arc<dyn courier_agent::LlmProvider> = Arc::new(AnthropicProvider::new(
        api_key.clone(),
        config.anthropic.base_url.clone(),
    ));
    let files_api = Arc::new(FilesApiClient::new(
        api_key,
        config.anthropic.base_url.clone(),
        config.policy.files_api_ttl_hours,
    ));
    let sandbox = SandboxClient::from_config(&config.sandbox)?.map(Arc::new);
    let transcription = TranscriptionClient::from_config(&config.transcription)?.map(Arc::new);

    let balance = Arc::new(BalanceService::new(Arc::clone(&db), Arc::clone(&cache)));
    let policy = BalancePolicy::new(
        Arc::clone(&db),
        Arc::clone(&cache),
        Usd::new(config.policy.minimum_balance_for_request),
    );
    let limiter = UserConcurrencyLimiter::new(
        config.policy.max_concurrent_per_user,
        Duration::from_secs(config.policy.queue_timeout_secs),
    );

    // Background write-behind drivers.
    flush::spawn_flush_task(Arc::clone(&db), Arc::clone(&write_queue));
    flush::spawn_dlq_replay_task(Arc::clone(&write_queue));

    let bot = Bot::new(&config.telegram.bot_token);
    let ctx = Arc::new(AppContext {
        bot: bot.clone(),
        config,
        metrics,
        cache,
        db,
        write_queue,
        provider,
        files_api,
        sandbox,
        transcription,
        registry: ToolRegistry::builtin(),
        policy,
        balance,
        limiter,
        generations: GenerationTracker::new(),
        uploads: UploadTracker::new(),
    });

    let queue = MessageQueueManager::new(Arc::clone(&ctx) as Arc<dyn courier_telegram::BatchHandler>);
    run_dispatcher(bot, ctx, queue).await;
    Ok(())
}
