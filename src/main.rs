//! Trade Sentinel - Main Entry Point
//!
//! Runs the key-level watcher and order monitors against a ProjectX broker,
//! and offers one-shot commands for sizing, execution and inspection.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;
use trade_sentinel::config::Config;
use trade_sentinel::exchange::{BrokerApi, ProjectXClient};
use trade_sentinel::monitor::{
    CommandAdvisor, Confirmation, ConfirmationSource, FixedConfirmation, LevelWatcher,
    MonitorContext, MonitorSettings, MonitorState, MonitorSupervisor, StdinConfirmation,
    SupervisionAdvisor,
};
use trade_sentinel::notify::{self, Notifier};
use trade_sentinel::persistence::{MonitoredOrder, Store};
use trade_sentinel::risk::{merge_positions, reconcile, to_bracket, RiskBudget, RiskSizer};
use trade_sentinel::strategy::{
    instrument_symbol, AnalysisRequest, AnalyzeAndExecute, CommandWorkflow, DecisionWorkflow,
    ExecutionOutcome, TradeExecutor, TradePlan,
};

/// Trade Sentinel CLI
#[derive(Parser)]
#[command(name = "trade-sentinel")]
#[command(version, about = "Risk-sized futures execution with order and key-level monitors")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch stored key levels and resume unfinished order monitors
    Watch {
        /// Act on every trigger without asking
        #[arg(long)]
        yes: bool,
    },

    /// Monitor an order that is already working at the broker
    Escort {
        /// Broker order id
        order_id: i64,
    },

    /// Resume persisted order monitors and wait for them to finish
    Resume,

    /// Offline position sizing and bracket preview
    Size {
        /// Instrument symbol used for the contract cap (e.g. MGC)
        symbol: String,
        #[arg(long)]
        entry: Decimal,
        #[arg(long)]
        stop: Decimal,
        #[arg(long)]
        target: Decimal,
        /// Account balance in USD
        #[arg(long)]
        balance: Decimal,
        /// Percent of balance to risk (clamped to the configured range)
        #[arg(long)]
        risk_percent: Option<Decimal>,
        #[arg(long)]
        tick_size: Decimal,
        /// Dollar value of one tick
        #[arg(long)]
        tick_value: Decimal,
    },

    /// Net positions from the trade ledger, cross-checked with live positions
    Positions,

    /// List stored key levels
    Levels {
        /// Only levels for this instrument
        instrument: Option<String>,
    },

    /// Print the monitor journal of an order
    Journal { order_id: i64 },

    /// Place a trade plan read from a JSON file ("-" for stdin)
    Execute {
        /// Instrument symbol or alias (e.g. MGC, gold)
        symbol: String,
        plan: PathBuf,
    },

    /// Ask the analysis command for a plan, optionally executing it
    Analyze {
        /// Instrument symbol or alias
        symbol: String,
        #[arg(long)]
        execute: bool,
    },
}

/// Shared services for commands that talk to the broker.
struct Services {
    config: Config,
    broker: Arc<dyn BrokerApi>,
    store: Arc<Store>,
    notifier: Arc<dyn Notifier>,
}

impl Services {
    fn connect(config: Config) -> Result<Self> {
        let broker = ProjectXClient::new(&config.broker).context("Failed to create broker client")?;
        let store = Store::open(&config.storage.db_path)?;
        let notifier = notify::from_config(&config);
        info!(channel = notifier.name(), db = %config.storage.db_path, "Services ready");

        Ok(Self {
            broker: Arc::new(broker),
            store: Arc::new(store),
            notifier,
            config,
        })
    }

    fn supervisor(&self) -> Arc<MonitorSupervisor> {
        let advisor = self.config.monitor.advisor_command.as_ref().map(|cmd| {
            Arc::new(CommandAdvisor::new(cmd.clone(), self.config.monitor.command_timeout()))
                as Arc<dyn SupervisionAdvisor>
        });

        Arc::new(MonitorSupervisor::new(
            MonitorContext {
                broker: self.broker.clone(),
                store: self.store.clone(),
                notifier: self.notifier.clone(),
                advisor,
                settings: MonitorSettings::from(&self.config.monitor),
            },
            self.config.monitor.max_restarts,
        ))
    }

    fn executor(&self, supervisor: Arc<MonitorSupervisor>) -> TradeExecutor {
        TradeExecutor::new(
            self.broker.clone(),
            self.store.clone(),
            self.notifier.clone(),
            &self.config,
        )
        .with_monitors(supervisor)
    }

    fn workflow(&self) -> Result<Arc<dyn DecisionWorkflow>> {
        let command = self
            .config
            .watcher
            .analysis_command
            .clone()
            .context("watcher.analysis_command is not configured")?;
        Ok(Arc::new(CommandWorkflow::new(
            command,
            self.config.monitor.command_timeout(),
        )))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let config = Config::load()?;
    config.validate()?;

    match cli.command {
        Commands::Size {
            symbol,
            entry,
            stop,
            target,
            balance,
            risk_percent,
            tick_size,
            tick_value,
        } => show_sizing(
            &config,
            &symbol,
            entry,
            stop,
            target,
            balance,
            risk_percent,
            tick_size,
            tick_value,
        ),
        Commands::Levels { instrument } => {
            let store = Store::open(&config.storage.db_path)?;
            show_levels(&store, instrument.as_deref())
        }
        Commands::Journal { order_id } => {
            let store = Store::open(&config.storage.db_path)?;
            show_journal(&store, order_id)
        }
        Commands::Watch { yes } => run_watch(Services::connect(config)?, yes).await,
        Commands::Escort { order_id } => run_escort(Services::connect(config)?, order_id).await,
        Commands::Resume => run_resume(Services::connect(config)?).await,
        Commands::Positions => show_positions(Services::connect(config)?).await,
        Commands::Execute { symbol, plan } => {
            run_execute(Services::connect(config)?, &symbol, &plan).await
        }
        Commands::Analyze { symbol, execute } => {
            run_analyze(Services::connect(config)?, &symbol, execute).await
        }
    }
}

/// Initialize logging with console and hourly rolling file output.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "trade-sentinel.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer guard alive for the whole run.
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("trade_sentinel=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

fn resolve_symbol(query: &str) -> String {
    instrument_symbol(query)
        .map(str::to_string)
        .unwrap_or_else(|| query.trim().to_ascii_uppercase())
}

/// Flag set on ctrl-c.
fn shutdown_flag() -> Arc<AtomicBool> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Shutdown signal received");
        shutdown_clone.store(true, Ordering::SeqCst);
    });
    shutdown
}

/// Wait for every monitor to finish, or stop them all on ctrl-c.
async fn wait_for_monitors(supervisor: &MonitorSupervisor) {
    if supervisor.active() == 0 {
        return;
    }
    info!(active = supervisor.active(), "Waiting for order monitors (ctrl-c to stop)");

    tokio::select! {
        results = supervisor.wait_all() => log_finished(&results),
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 Shutdown signal received");
            supervisor.shutdown().await;
        }
    }
}

fn log_finished(results: &[(i64, MonitorState)]) {
    for (order_id, state) in results {
        info!(order_id, %state, "Order monitor finished");
    }
}

async fn run_watch(services: Services, yes: bool) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║            Trade Sentinel v{} - Level Watcher            ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    let supervisor = services.supervisor();
    let resumed = supervisor.resume().await?;
    info!(resumed, "📂 Unfinished order monitors resumed");

    let executor = Arc::new(services.executor(supervisor.clone()));
    let handler = Arc::new(AnalyzeAndExecute::new(services.workflow()?, executor));
    let confirmation: Arc<dyn ConfirmationSource> = if yes {
        warn!("⚠️  Auto-confirm enabled, every trigger will be acted on");
        Arc::new(FixedConfirmation(Confirmation::Confirmed))
    } else {
        Arc::new(StdinConfirmation::new())
    };

    let watcher = Arc::new(LevelWatcher::new(
        services.broker.clone(),
        services.store.clone(),
        services.notifier.clone(),
        confirmation,
        handler,
        &services.config.watcher,
    ));

    let shutdown = shutdown_flag();
    let watcher_task = {
        let watcher = watcher.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { watcher.run(shutdown).await })
    };

    info!("🚀 Watching key levels");
    while !shutdown.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_secs(1)).await;
        log_finished(&supervisor.reap().await);
    }

    if let Err(e) = watcher_task.await {
        error!(error = %e, "Level watcher task failed");
    }
    supervisor.shutdown().await;
    info!("👋 Trade Sentinel stopped");
    Ok(())
}

async fn run_escort(services: Services, order_id: i64) -> Result<()> {
    let account = services
        .broker
        .account(services.config.broker.account_name.as_deref())
        .await?;
    let order = services
        .broker
        .find_order(account.id, order_id, services.config.monitor.order_lookback())
        .await?
        .with_context(|| format!("Order #{} not found on account {}", order_id, account.name))?;

    let supervisor = services.supervisor();
    supervisor
        .spawn(MonitoredOrder {
            order_id,
            account_id: account.id,
            contract_id: order.contract_id.clone(),
            expected_side: order.side,
            started_at: Utc::now(),
            state: MonitorState::PendingFill,
        })
        .await?;
    info!(order_id, contract = %order.contract_id, side = %order.side, "Escorting order");

    wait_for_monitors(&supervisor).await;
    Ok(())
}

async fn run_resume(services: Services) -> Result<()> {
    let supervisor = services.supervisor();
    let resumed = supervisor.resume().await?;
    println!("Resumed {} order monitor(s)", resumed);
    wait_for_monitors(&supervisor).await;
    Ok(())
}

async fn run_execute(services: Services, symbol: &str, plan_path: &Path) -> Result<()> {
    let text = if plan_path.as_os_str() == "-" {
        std::io::read_to_string(std::io::stdin())?
    } else {
        std::fs::read_to_string(plan_path)
            .with_context(|| format!("Failed to read plan {}", plan_path.display()))?
    };
    let value: serde_json::Value = serde_json::from_str(&text).context("Plan is not valid JSON")?;
    let Some(plan) = TradePlan::from_value(value)? else {
        bail!("Plan file carries no trade data");
    };

    let supervisor = services.supervisor();
    let executor = services.executor(supervisor.clone());
    let source_id = format!("plan-{}", Utc::now().timestamp_millis());
    let outcome = executor.execute(&resolve_symbol(symbol), &plan, &source_id).await?;
    print_outcome(&outcome);

    wait_for_monitors(&supervisor).await;
    Ok(())
}

async fn run_analyze(services: Services, query: &str, execute: bool) -> Result<()> {
    let symbol = resolve_symbol(query);
    let price = match services.broker.active_contract(&symbol).await {
        Ok(contract) => services
            .broker
            .latest_price(&contract.id, services.config.watcher.price_lookback())
            .await
            .ok(),
        Err(e) => {
            warn!(%symbol, error = %e, "Contract lookup failed, analysing without a price");
            None
        }
    };

    let request = AnalysisRequest {
        instrument: symbol.clone(),
        price,
        level: None,
    };
    let Some(plan) = services.workflow()?.decide(&request).await? else {
        println!("No trade plan for {}", symbol);
        return Ok(());
    };
    println!("{}", serde_json::to_string_pretty(&plan)?);

    if execute {
        let supervisor = services.supervisor();
        let executor = services.executor(supervisor.clone());
        let source_id = format!("analysis-{}", Utc::now().timestamp_millis());
        print_outcome(&executor.execute(&symbol, &plan, &source_id).await?);
        wait_for_monitors(&supervisor).await;
    }
    Ok(())
}

fn print_outcome(outcome: &ExecutionOutcome) {
    match outcome {
        ExecutionOutcome::NoTrade(reason) => println!("No trade: {}", reason),
        ExecutionOutcome::PositionOpen { contract_id, net } => {
            println!("Position already open on {} (net {}), nothing placed", contract_id, net)
        }
        ExecutionOutcome::Placed {
            order_id,
            contract_id,
            side,
            size,
            kind,
            sizing,
            bracket,
            monitored,
        } => {
            println!("\n✅ Order #{} placed", order_id);
            println!("   ├─ {} {} {} x{}", kind, side, contract_id, size);
            println!("   ├─ Risk:    ${:.2}", sizing.total_risk_usd);
            println!("   ├─ Profit:  ${:.2}", sizing.total_profit_usd);
            println!(
                "   ├─ Bracket: SL {:?} / TP {:?} ticks",
                bracket.stop_loss_ticks, bracket.take_profit_ticks
            );
            println!("   └─ Monitored: {}", monitored);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn show_sizing(
    config: &Config,
    symbol: &str,
    entry: Decimal,
    stop: Decimal,
    target: Decimal,
    balance: Decimal,
    risk_percent: Option<Decimal>,
    tick_size: Decimal,
    tick_value: Decimal,
) -> Result<()> {
    let symbol = resolve_symbol(symbol);
    let bracket = to_bracket(entry, Some(stop), Some(target), tick_size)?;
    let budget = RiskBudget::new(config.risk.clone());
    let max_risk = budget.max_risk_usd(balance, risk_percent);
    let sizing = RiskSizer::from_config(&config.risk).size(
        entry,
        stop,
        target,
        tick_value / tick_size,
        max_risk,
        budget.cap_for(&symbol),
    )?;

    println!("\n📐 Sizing for {}", symbol);
    println!(
        "   ├─ Risk budget:      ${:.2} ({}% of ${:.2})",
        max_risk,
        budget.effective_percent(risk_percent),
        balance
    );
    println!("   ├─ Risk per unit:    {}", sizing.risk_per_unit);
    println!("   ├─ Risk/contract:    ${:.2}", sizing.risk_per_contract);
    println!("   ├─ Raw size:         {:.4}", sizing.raw_size);
    println!("   ├─ Position size:    {} (cap {})", sizing.position_size, budget.cap_for(&symbol));
    println!("   ├─ Total risk:       ${:.2}", sizing.total_risk_usd);
    println!("   ├─ Total profit:     ${:.2}", sizing.total_profit_usd);
    match sizing.risk_reward_ratio {
        Some(ratio) => println!("   ├─ Reward/risk:      {:.2}", ratio),
        None => println!("   ├─ Reward/risk:      unbounded"),
    }
    println!("   ├─ Daily target met: {}", sizing.meets_target);
    match sizing.contracts() {
        Ok(contracts) => println!("   ├─ Contracts:        {}", contracts),
        Err(e) => println!("   ├─ Contracts:        none ({})", e),
    }
    println!(
        "   └─ Bracket ticks:    SL {:?} / TP {:?}",
        bracket.stop_loss_ticks, bracket.take_profit_ticks
    );
    println!();
    Ok(())
}

async fn show_positions(services: Services) -> Result<()> {
    let account = services
        .broker
        .account(services.config.broker.account_name.as_deref())
        .await?;
    let end = Utc::now();
    let trades = services
        .broker
        .trades(account.id, end - services.config.monitor.order_lookback(), end)
        .await?;
    let ledger = reconcile(&trades);

    let live = match services.broker.open_positions(account.id).await {
        Ok(live) => live,
        Err(e) => {
            warn!(error = %e, "Live positions unavailable, showing ledger only");
            Vec::new()
        }
    };

    println!("\n📊 Positions for {} (balance ${:.2})", account.name, account.balance);
    let views = merge_positions(&ledger, &live);
    if views.is_empty() {
        println!("   └─ Flat");
    }
    for view in views {
        let live = view
            .live_size
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        let flag = if view.agrees { "" } else { "  ⚠️  mismatch" };
        println!(
            "   ├─ {:<24} ledger {:>6}  live {:>6}{}",
            view.contract_id, view.net_size, live, flag
        );
    }
    println!();
    Ok(())
}

fn show_levels(store: &Store, instrument: Option<&str>) -> Result<()> {
    let instrument = instrument.map(resolve_symbol);
    let levels = store.levels(instrument.as_deref())?;

    println!("\n🎯 Key levels ({})", levels.len());
    for level in levels {
        println!(
            "   ├─ #{:<5} {:<6} {:>12} {:<14} {:<10} {}  ({})",
            level.id,
            level.instrument,
            level.level,
            level.kind.to_string(),
            level.status.as_str(),
            level.created_at.format("%Y-%m-%d %H:%M"),
            level.source_id
        );
    }
    println!();
    Ok(())
}

fn show_journal(store: &Store, order_id: i64) -> Result<()> {
    match store.monitored_order(order_id)? {
        Some(record) => println!(
            "\n📒 Order #{} {} {} since {} (state {})",
            record.order_id,
            record.expected_side,
            record.contract_id,
            record.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            record.state
        ),
        None => println!("\n📒 Order #{} (no monitor record)", order_id),
    }

    for entry in store.journal(order_id)? {
        println!(
            "   ├─ {} {:<16} {}",
            entry.timestamp.format("%H:%M:%S"),
            entry.event,
            entry.detail
        );
    }
    println!();
    Ok(())
}
