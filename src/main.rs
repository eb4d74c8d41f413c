use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use quantflow::broker::{AlpacaClient, Broker, PaperBroker};
use quantflow::config::{BrokerKind, ParamsHandle, Settings, StrategyParams};
use quantflow::consumer::ConsumerRuntime;
use quantflow::events::{BarsEvent, BARS_STREAM};
use quantflow::models::KillSwitchSource;
use quantflow::risk::{KillSwitch, RedisKillSwitchStore};
use quantflow::stages::{
    BrokerExecutor, ExitEvaluator, LedgerAccountant, OrderGenerator, RiskOptimizer,
    SignalGenerator, Stage, StageContext, StageHandler,
};
use quantflow::store::{PostgresStore, TradingStore};
use quantflow::stream::{publish_event, RedisStreamLog, StreamLog};
use quantflow::telemetry::{StreamTelemetry, Telemetry};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Duration, Instant};

/// Fill sync and pending-order retry cadence for the executor.
const EXECUTOR_SWEEP_SECS: u64 = 60;

#[derive(Parser)]
#[command(name = "quantflow", about = "Event-driven systematic trading pipeline")]
struct Cli {
    /// Settings file (without extension)
    #[arg(long, default_value = "config/quantflow")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one stage worker, or every stage with `all`
    Run { stage: String },
    /// Publish a bars batch_complete event
    EmitBars {
        #[arg(long)]
        date: NaiveDate,
        #[arg(long, value_delimiter = ',', required = true)]
        symbols: Vec<String>,
    },
    /// Inspect or flip the kill switch
    KillSwitch {
        #[command(subcommand)]
        action: KillSwitchAction,
    },
    /// Convert broker-filled accepted orders into fills
    SyncFills,
    /// Republish order_retry for orders left pending
    RetryPending,
    /// Print the validated parameter snapshot, or set an override
    Params {
        #[command(subcommand)]
        action: Option<ParamsAction>,
    },
}

#[derive(Subcommand)]
enum KillSwitchAction {
    Activate {
        #[arg(long, default_value = "manual halt")]
        reason: String,
    },
    Deactivate {
        #[arg(long, default_value = "manual resume")]
        reason: String,
    },
    Status,
}

#[derive(Subcommand)]
enum ParamsAction {
    Set { key: String, value: String },
}

// ============================================================================
// Wiring
// ============================================================================

struct Services {
    settings: Settings,
    store: Arc<PostgresStore>,
    kill_switch_conn: RedisStreamLog,
    params: ParamsHandle,
    broker: Arc<dyn Broker>,
}

impl Services {
    async fn connect(settings: Settings) -> anyhow::Result<Self> {
        let store = Arc::new(
            PostgresStore::connect(&settings.database_url)
                .await
                .context("connecting to Postgres")?,
        );
        let kill_switch_conn = RedisStreamLog::connect(&settings.redis_url)
            .await
            .context("connecting to Redis")?;

        let params = ParamsHandle::new(load_params(&settings, store.as_ref()).await?);

        let broker: Arc<dyn Broker> = match settings.broker.kind {
            BrokerKind::Paper => {
                tracing::info!("📄 Using paper broker");
                Arc::new(PaperBroker::new().with_market_data(store.clone()))
            }
            BrokerKind::Alpaca => {
                tracing::info!("🏦 Using Alpaca at {}", settings.broker.base_url);
                Arc::new(AlpacaClient::new(&settings.broker)?)
            }
        };

        Ok(Self {
            settings,
            store,
            kill_switch_conn,
            params,
            broker,
        })
    }

    /// Stage context over its own stream connection.
    async fn context(&self) -> anyhow::Result<(StageContext, Arc<dyn StreamLog>, Arc<dyn Telemetry>)> {
        let stream: Arc<dyn StreamLog> = Arc::new(
            RedisStreamLog::connect(&self.settings.redis_url)
                .await
                .context("connecting worker to Redis")?,
        );
        let telemetry: Arc<dyn Telemetry> = Arc::new(StreamTelemetry::new(stream.clone()));
        let kill_switch = KillSwitch::new(
            &self.settings.portfolio_id,
            Arc::new(RedisKillSwitchStore::new(self.kill_switch_conn.connection())),
            self.store.clone(),
            stream.clone(),
            telemetry.clone(),
        )
        .with_broker(self.broker.clone());

        let ctx = StageContext {
            portfolio_id: self.settings.portfolio_id.clone(),
            initial_capital: self.settings.initial_capital,
            store: self.store.clone(),
            market: self.store.clone(),
            stream: stream.clone(),
            telemetry: telemetry.clone(),
            kill_switch,
            params: self.params.clone(),
        };
        Ok((ctx, stream, telemetry))
    }

    fn handler(&self, stage: Stage, ctx: StageContext) -> Box<dyn StageHandler> {
        match stage {
            Stage::Signals => Box::new(SignalGenerator::new(ctx)),
            Stage::Optimizer => Box::new(RiskOptimizer::new(ctx)),
            Stage::Exits => Box::new(ExitEvaluator::new(ctx)),
            Stage::Orders => Box::new(OrderGenerator::new(ctx)),
            Stage::Executor => Box::new(BrokerExecutor::new(ctx, self.broker.clone())),
            Stage::Ledger => Box::new(LedgerAccountant::new(ctx)),
        }
    }
}

async fn load_params(settings: &Settings, store: &dyn TradingStore) -> anyhow::Result<StrategyParams> {
    let overrides = store.load_param_overrides().await?;
    let params = settings
        .params
        .clone()
        .with_overrides(overrides.iter().map(|(k, v)| (k.as_str(), v.as_str())))?;
    Ok(params)
}

fn setup_logging(filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)?;
    setup_logging(&settings.log_filter);

    let services = Services::connect(settings).await?;

    match cli.command {
        Command::Run { stage } => run_workers(services, &stage).await,
        Command::EmitBars { date, symbols } => {
            let (ctx, _, _) = services.context().await?;
            let id = publish_event(
                ctx.stream.as_ref(),
                BARS_STREAM,
                &BarsEvent::batch_complete(date, &symbols),
            )
            .await?;
            tracing::info!("📨 Published bars batch {} for {} symbols ({})", date, symbols.len(), id);
            Ok(())
        }
        Command::KillSwitch { action } => {
            let (ctx, _, _) = services.context().await?;
            match action {
                KillSwitchAction::Activate { reason } => {
                    if !ctx.kill_switch.activate(&reason, KillSwitchSource::Manual).await? {
                        tracing::info!("Kill switch already active");
                    }
                }
                KillSwitchAction::Deactivate { reason } => {
                    if !ctx.kill_switch.deactivate(&reason).await? {
                        tracing::info!("Kill switch already inactive");
                    }
                }
                KillSwitchAction::Status => {}
            }
            let state = ctx.kill_switch.state().await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(())
        }
        Command::SyncFills => {
            let (ctx, _, _) = services.context().await?;
            let filled = BrokerExecutor::new(ctx, services.broker.clone())
                .sync_fills()
                .await?;
            println!("{} fills recorded", filled);
            Ok(())
        }
        Command::RetryPending => {
            let (ctx, _, _) = services.context().await?;
            let retried = BrokerExecutor::new(ctx, services.broker.clone())
                .retry_pending()
                .await?;
            println!("{} orders republished", retried);
            Ok(())
        }
        Command::Params { action } => {
            if let Some(ParamsAction::Set { key, value }) = action {
                // Validate against the full override set before persisting.
                let mut overrides = services.store.load_param_overrides().await?;
                overrides.retain(|(k, _)| *k != key);
                overrides.push((key.clone(), value.clone()));
                services
                    .settings
                    .params
                    .clone()
                    .with_overrides(overrides.iter().map(|(k, v)| (k.as_str(), v.as_str())))?;
                services.store.set_param_override(&key, &value).await?;
                tracing::info!("⚙️ Set {} = {}", key, value);
            }
            let params = load_params(&services.settings, services.store.as_ref()).await?;
            println!("{}", serde_json::to_string_pretty(&params)?);
            Ok(())
        }
    }
}

// ============================================================================
// Workers
// ============================================================================

async fn run_workers(services: Services, selection: &str) -> anyhow::Result<()> {
    let stages: Vec<Stage> = if selection == "all" {
        Stage::ALL.to_vec()
    } else {
        vec![Stage::parse(selection).with_context(|| format!("unknown stage {}", selection))?]
    };

    tracing::info!("🚀 quantflow starting for portfolio {}", services.settings.portfolio_id);
    let params = services.params.snapshot();
    tracing::info!("📊 Configuration:");
    tracing::info!("  Strategy: {}", params.signal.strategy_version);
    tracing::info!("  Initial capital: ${:.2}", services.settings.initial_capital);
    tracing::info!("  Max gross exposure: {:.0}%", params.risk.max_gross_exposure * 100.0);
    tracing::info!("  Max daily loss: {:.0}%", params.breakers.max_daily_loss_pct * 100.0);
    tracing::info!("  Max drawdown: {:.0}%", params.breakers.max_drawdown_pct * 100.0);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: JoinSet<quantflow::Result<()>> = JoinSet::new();
    let instance = uuid::Uuid::new_v4().simple().to_string();

    for stage in stages {
        let (ctx, stream, telemetry) = services.context().await?;
        let handler = services.handler(stage, ctx.clone());
        let runtime = ConsumerRuntime::new(
            stream,
            telemetry,
            services.settings.consumer.clone(),
            format!("{}-{}", stage.name(), &instance[..8]),
        );
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            runtime
                .run(stage.input_stream(), stage.group(), handler.as_ref(), shutdown)
                .await
        });
        tracing::info!("  🔄 {} consuming {}", stage.name(), stage.input_stream());

        if stage == Stage::Executor {
            let executor = BrokerExecutor::new(ctx, services.broker.clone());
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { executor_sweep_loop(executor, shutdown).await });
        }
    }

    if services.settings.params_reload_secs > 0 {
        let settings = services.settings.clone();
        let store = services.store.clone();
        let handle = services.params.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { params_reload_loop(settings, store, handle, shutdown).await });
    }

    tracing::info!("✅ All workers spawned. Press Ctrl+C to stop...");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("⚠️  Received Ctrl+C, shutting down...");
        }
        Some(result) = tasks.join_next() => {
            tracing::error!("Worker exited early: {:?}", result);
        }
    }

    let _ = shutdown_tx.send(true);
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(Err(e)) => tracing::error!("Worker failed: {}", e),
            Err(e) => tracing::error!("Worker panicked: {}", e),
            Ok(Ok(())) => {}
        }
    }

    tracing::info!("👋 quantflow stopped");
    Ok(())
}

async fn executor_sweep_loop(
    executor: BrokerExecutor,
    mut shutdown: watch::Receiver<bool>,
) -> quantflow::Result<()> {
    let period = Duration::from_secs(EXECUTOR_SWEEP_SECS);
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = executor.sync_fills().await {
                    tracing::warn!("Fill sync failed: {}", e);
                }
                if let Err(e) = executor.retry_pending().await {
                    tracing::warn!("Pending retry failed: {}", e);
                }
            }
            _ = shutdown.changed() => return Ok(()),
        }
    }
}

async fn params_reload_loop(
    settings: Settings,
    store: Arc<PostgresStore>,
    handle: ParamsHandle,
    mut shutdown: watch::Receiver<bool>,
) -> quantflow::Result<()> {
    let period = Duration::from_secs(settings.params_reload_secs);
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match load_params(&settings, store.as_ref()).await {
                    Ok(params) => {
                        handle.replace(params);
                        tracing::debug!("Parameters reloaded");
                    }
                    Err(e) => tracing::warn!("Parameter reload failed, keeping snapshot: {}", e),
                }
            }
            _ = shutdown.changed() => return Ok(()),
        }
    }
}
