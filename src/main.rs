/// Main entry point: the live swing-break orchestrator
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use swingbreak::{
    broker::{BrokerApi, OpenAlgoClient, PaperBroker},
    config::{load_config, Config},
    data::{generate_option_symbols, DataPipeline},
    error::{Result, TradingError},
    filter::{BestStrikes, ContinuousFilter},
    notify::{TelegramCommandListener, TelegramNotifier},
    orders::OrderManager,
    positions::PositionTracker,
    state::{StateManager, Switch},
    swing::MultiSwingDetector,
    time::MarketSession,
    types::{
        DailyExitReason, EntryAction, Fill, OperationalState, OptionType, SwingType,
        TriggerAction,
    },
};

/// Watchdog cadence within the tick loop
const WATCHDOG_INTERVAL_SECS: i64 = 30;
/// Position reconciliation cadence
const RECONCILE_INTERVAL_SECS: i64 = 60;
/// Heartbeat log cadence
const HEARTBEAT_INTERVAL_SECS: i64 = 60;
/// Wall-clock bound on graceful shutdown
const SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Application state: all trading subsystems composed around one tick loop
struct TradingApp {
    config: Arc<Config>,
    session: MarketSession,
    order_broker: Arc<dyn BrokerApi>,
    pipeline: Arc<DataPipeline>,
    notifier: Arc<TelegramNotifier>,
    state: StateManager,
    swing_detector: MultiSwingDetector,
    filter: ContinuousFilter,
    order_manager: OrderManager,
    tracker: PositionTracker,
    kill_switch: Switch,
    pause_switch: Switch,
    status_text: Arc<RwLock<String>>,
    symbols: Vec<String>,
    session_id: String,

    // Tick-loop state
    last_sent_bar_ts: HashMap<String, DateTime<Utc>>,
    processed_fill_ids: HashSet<String>,
    previous_best: HashMap<OptionType, Option<String>>,
    stale_blocked: HashSet<String>,
    eod_exit_done: bool,
    was_paused: bool,
    shutdown_requested: Arc<AtomicBool>,
}

impl TradingApp {
    fn new(config: Arc<Config>) -> Result<Self> {
        let session = MarketSession::from_config(&config)?;

        std::fs::create_dir_all(&config.state_dir)?;

        let notifier = Arc::new(TelegramNotifier::new(&config));

        // The data pipeline always talks to the real gateway for history;
        // order flow goes through the paper broker under DRY_RUN
        let rest_client: Arc<dyn BrokerApi> = Arc::new(OpenAlgoClient::new(
            config.broker_host.clone(),
            config.broker_api_key.clone(),
            config.exchange.clone(),
            config.product.clone(),
        ));
        let order_broker: Arc<dyn BrokerApi> = if config.dry_run {
            info!("📝 DRY RUN mode - broker mutations suppressed");
            Arc::new(PaperBroker::new())
        } else {
            info!("💰 LIVE trading mode");
            Arc::clone(&rest_client)
        };

        let pipeline = Arc::new(DataPipeline::new(
            Arc::clone(&config),
            session,
            Arc::clone(&rest_client),
            Arc::clone(&notifier),
        ));

        let state = StateManager::open(std::path::Path::new(&config.db_path))?;

        if config.atm_strike == 0 || config.expiry_date.is_empty() {
            return Err(TradingError::ConfigError(
                "atm_strike and expiry_date must be provided by the launcher".to_string(),
            ));
        }

        let symbols = generate_option_symbols(
            config.atm_strike,
            &config.expiry_date,
            config.strike_scan_range,
            config.strike_step,
        );
        info!(
            "Universe: {} symbols around ATM {} ({})",
            symbols.len(),
            config.atm_strike,
            config.expiry_date
        );

        let swing_detector = MultiSwingDetector::new(&symbols, config.max_bars_per_symbol);
        let filter = ContinuousFilter::new(Arc::clone(&config), config.expiry_date.clone());
        let order_manager = OrderManager::new(Arc::clone(&config), Arc::clone(&order_broker));

        let trade_date = session.trade_date(Utc::now());
        let tracker = PositionTracker::new(
            Arc::clone(&config),
            Arc::clone(&order_broker),
            Arc::clone(&notifier),
            trade_date,
        );

        let state_dir = std::path::Path::new(&config.state_dir);
        let kill_switch = Switch::kill(state_dir);
        let pause_switch = Switch::pause(state_dir);

        Ok(TradingApp {
            config,
            session,
            order_broker,
            pipeline,
            notifier,
            state,
            swing_detector,
            filter,
            order_manager,
            tracker,
            kill_switch,
            pause_switch,
            status_text: Arc::new(RwLock::new("starting".to_string())),
            symbols,
            session_id: uuid::Uuid::new_v4().to_string(),
            last_sent_bar_ts: HashMap::new(),
            processed_fill_ids: HashSet::new(),
            previous_best: HashMap::from([(OptionType::CE, None), (OptionType::PE, None)]),
            stale_blocked: HashSet::new(),
            eod_exit_done: false,
            was_paused: false,
            shutdown_requested: Arc::new(AtomicBool::new(false)),
        })
    }

    // ── Startup ───────────────────────────────────────────────────────

    async fn run(&mut self) -> Result<()> {
        info!("{}", "=".repeat(78));
        info!("Starting swing-break live engine (session {})", self.session_id);
        info!("{}", "=".repeat(78));

        self.state
            .update_operational_state(OperationalState::Starting, None)?;
        self.setup_signal_handler();
        self.start_command_listener().await;

        // 1. Restore durable state (or reset for a new day)
        self.restore_state()?;

        // 2. Pre-flight health checks
        if let Err(e) = self.preflight_check().await {
            if e.is_fatal() {
                error!("Permanent startup error: {} - exiting", e);
                self.state
                    .update_operational_state(OperationalState::Error, Some(&e.to_string()))?;
                self.notifier
                    .notify_error(&format!("STARTUP FAILURE (permanent): {}", e));
                return Err(e);
            }
            self.enter_waiting_mode(&e.to_string()).await;
        }

        self.notifier.send_message(format!(
            "🚀 Engine started\nMode: {}\nExpiry: {} | ATM: {}",
            if self.config.dry_run { "PAPER" } else { "LIVE" },
            self.config.expiry_date,
            self.config.atm_strike
        ));

        // 3. Connect feeds and subscribe the universe
        self.pipeline.connect().await?;
        if let Err(e) = self.pipeline.connect_backup().await {
            warn!("Backup feed unavailable at startup: {}", e);
        }
        self.pipeline.start_tick_router().await;
        self.pipeline.subscribe(&self.symbols).await?;
        self.pipeline.start_connection_monitor().await;

        // 4. Historical backfill and gap fill
        info!("[HIST] Loading today's bars from market open...");
        self.pipeline.load_historical_data(&self.symbols).await?;
        self.pipeline.fill_initial_gap().await?;

        // 5. Silent swing replay, DB backfill, startup protection
        self.replay_history().await?;

        // 6. Reconcile restored orders against broker reality
        self.reconcile_orders().await?;

        self.state
            .update_operational_state(OperationalState::Active, None)?;
        info!("Startup complete - entering tick loop");

        self.run_trading_loop().await
    }

    fn restore_state(&mut self) -> Result<()> {
        let today = self.session.trade_date(Utc::now());

        match self.state.load_daily_state()? {
            Some(daily) if daily.trade_date == today => {
                info!("Same-day restart detected ({}), restoring state", today);

                let open = self.state.load_open_positions()?;
                self.tracker
                    .restore_state(open, Vec::new(), daily.cumulative_r, daily.daily_exit_reason);
                self.eod_exit_done = daily.daily_exit_reason == Some(DailyExitReason::Eod);

                let (pending, active_sl) = self.state.load_orders()?;
                self.order_manager.restore_state(pending, active_sl);
            }
            Some(_) | None => {
                info!("New trading day ({}), resetting dashboard data", today);
                self.state.reset_daily_dashboard()?;
            }
        }

        Ok(())
    }

    /// Connectivity and credential verification before trading starts
    async fn preflight_check(&self) -> Result<()> {
        match self.order_broker.available_cash().await {
            Ok(cash) => {
                info!("Pre-flight OK: available cash ₹{:.0}", cash);
                Ok(())
            }
            Err(e) => {
                let message = e.to_string().to_lowercase();
                if message.contains("key") || message.contains("auth") {
                    Err(TradingError::CredentialFailure(e.to_string()))
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Transient startup failure: re-check every minute, status ping hourly,
    /// never give up mid-session
    async fn enter_waiting_mode(&mut self, reason: &str) {
        warn!("Entering WAITING mode: {}", reason);
        let _ = self
            .state
            .update_operational_state(OperationalState::Waiting, Some(reason));
        self.notifier
            .notify_error(&format!("Transient startup error - WAITING\n{}", reason));

        let mut checks = 0u64;
        loop {
            if self.shutdown_requested.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            checks += 1;

            match self.preflight_check().await {
                Ok(()) => {
                    info!("WAITING mode resolved after {} checks", checks);
                    self.notifier
                        .send_message("✅ Connectivity restored - resuming startup".to_string());
                    let _ = self
                        .state
                        .update_operational_state(OperationalState::Active, None);
                    return;
                }
                Err(e) => {
                    if checks % 60 == 0 {
                        self.notifier.notify_error(&format!(
                            "Still WAITING after {} minutes\n{}",
                            checks, e
                        ));
                    }
                }
            }
        }
    }

    /// Replay the backfilled bars through the swing detectors silently, then
    /// persist confirmed swings, mark already-broken candidates, and switch
    /// to live detection.
    async fn replay_history(&mut self) -> Result<()> {
        info!("[SWING] Replaying historical bars through swing detection...");

        // Same-day restart leaves stale detector state that would reject the
        // replay as out-of-order
        self.swing_detector.reset_all();

        for symbol in &self.symbols {
            let bars = self.pipeline.get_bars_for_symbol(symbol).await;
            for bar in &bars {
                if let Some(swing) = self.swing_detector.update(symbol, bar) {
                    if swing.swing_type == SwingType::Low {
                        self.filter.add_swing_candidate(symbol, &swing);
                    }
                }
            }
        }

        // Seed the live-mode dedup baseline from what the detectors consumed
        for symbol in &self.symbols {
            if let Some(detector) = self.swing_detector.get(symbol) {
                if let Some(last) = detector.bars.last() {
                    self.last_sent_bar_ts.insert(symbol.clone(), last.timestamp);
                }
            }
        }

        // Backfill all confirmed swings in one batch (deduped by the store)
        let mut logged = 0usize;
        let mut duplicates = 0usize;
        for (symbol, swing) in self.swing_detector.all_swings() {
            match self.state.log_swing(&symbol, &swing) {
                Ok(true) => logged += 1,
                Ok(false) => duplicates += 1,
                Err(e) => warn!("Swing backfill failed for {}: {}", symbol, e),
            }
        }
        info!(
            "[HIST] Backfilled {} swings ({} duplicates skipped)",
            logged, duplicates
        );

        let latest = self.pipeline.get_all_latest_bars().await;
        self.state
            .save_or_warn("historical bars", |s| s.save_latest_bars(&latest));

        // Swings that already broke in history never generate orders
        self.filter.mark_historical_breaks(&self.swing_detector);

        self.swing_detector.enable_live_mode();
        Ok(())
    }

    /// Cross-check restored orders against the broker orderbook; fills that
    /// happened during the crash window flow through the normal fill path.
    async fn reconcile_orders(&mut self) -> Result<()> {
        let report = self
            .order_manager
            .reconcile_with_broker(&self.tracker.open_positions)
            .await?;

        if !report.entries_filled.is_empty() {
            let latest = self.pipeline.get_all_latest_bars().await;
            let prices: HashMap<String, f64> =
                latest.iter().map(|(s, b)| (s.clone(), b.close)).collect();

            for fill in report.entries_filled {
                warn!(
                    "[RECONCILE] Processing fill from crash window: {} @ {:.2}",
                    fill.symbol, fill.fill_price
                );
                self.handle_order_fill(fill, &prices).await?;
            }
        }

        if !report.sl_missing.is_empty() {
            let missing = report.sl_missing.join(", ");
            error!(
                "[CRITICAL] Positions without SL protection: {} - emergency shutdown",
                missing
            );
            self.notifier.send_message(format!(
                "🚨 MISSING SL ORDERS\n\nPositions without SL protection:\n{}\n\nEmergency shutdown initiated.",
                missing
            ));
            self.handle_emergency_shutdown().await;
            return Err(TradingError::MissingSlOrder(missing));
        }

        Ok(())
    }

    async fn start_command_listener(&self) {
        let listener = Arc::new(TelegramCommandListener::new(
            self.config.telegram_bot_token.clone(),
            self.config.telegram_chat_id.clone(),
            self.kill_switch.clone(),
            self.pause_switch.clone(),
            Arc::clone(&self.status_text),
        ));
        listener.start().await;
    }

    fn setup_signal_handler(&self) {
        let shutdown = Arc::clone(&self.shutdown_requested);
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut sigterm =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("failed to install SIGTERM handler");
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
            }
            warn!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });
    }

    // ── Tick loop ─────────────────────────────────────────────────────

    async fn run_trading_loop(&mut self) -> Result<()> {
        info!("Entering main trading loop...");

        let mut last_watchdog = Utc::now();
        let mut last_heartbeat = Utc::now();
        let mut last_reconcile = Utc::now();

        while !self.shutdown_requested.load(Ordering::SeqCst) {
            let now = Utc::now();

            // a. Kill switch: cancel entries, keep positions with broker SLs
            if self.kill_switch.is_asserted() {
                warn!("[KILL] Kill switch asserted - emergency-kill shutdown");
                let _ = self.state.set_control_flag("kill_requested", true);
                self.notifier.send_message(
                    "🛑 KILL switch detected\nCancelling entries; positions keep their broker SLs."
                        .to_string(),
                );
                for option_type in OptionType::BOTH {
                    self.order_manager
                        .manage_entry_for_type(option_type, None, None)
                        .await;
                }
                self.shutdown_requested.store(true, Ordering::SeqCst);
                break;
            }

            // b. Data freshness watchdog
            if (now - last_watchdog).num_seconds() > WATCHDOG_INTERVAL_SECS {
                last_watchdog = now;
                if !self.run_watchdog().await? {
                    // Watchdog escalated to emergency shutdown
                    return Err(TradingError::ReconnectFailed(
                        "watchdog reconnect failed".to_string(),
                    ));
                }
            }

            // c. Outside market hours: idle
            if !self.session.is_market_open(now) {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                continue;
            }

            // d. Forced end-of-day exit, exactly once
            if self.session.is_force_exit_time(now) {
                if !self.eod_exit_done {
                    warn!("Force exit time reached - EOD exit");
                    self.eod_exit_done = true;
                    self.handle_eod_exit().await;
                }
                // Monitor mode until market close
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                continue;
            }

            // e. Pause switch gates order placement only
            let paused = self.pause_switch.is_asserted();
            if paused != self.was_paused {
                self.was_paused = paused;
                let _ = self.state.set_control_flag("pause_requested", paused);
                let op_state = if paused {
                    OperationalState::Paused
                } else {
                    OperationalState::Active
                };
                let _ = self.state.update_operational_state(op_state, None);
                info!(
                    "[PAUSE] Order placement {}",
                    if paused { "suspended" } else { "resumed" }
                );
            }

            // f-p. One full evaluation pass
            if let Err(e) = self.process_tick(paused).await {
                if e.is_safety_critical() || e.is_fatal() {
                    return Err(e);
                }
                error!("Tick error: {} ({})", e, e.error_code());
            }

            // q. Heartbeat
            if (now - last_heartbeat).num_seconds() > HEARTBEAT_INTERVAL_SECS {
                last_heartbeat = now;
                self.log_heartbeat().await;
            }

            // o. Periodic broker position reconciliation
            if (now - last_reconcile).num_seconds() > RECONCILE_INTERVAL_SECS {
                last_reconcile = now;
                let phantom = self.tracker.reconcile_with_broker().await;
                for symbol in phantom {
                    self.filter.remove_candidate(&symbol);
                    info!("[PHANTOM-CLEANUP] {} removed from filter after broker close", symbol);
                }
            }

            tokio::time::sleep(std::time::Duration::from_secs(
                self.config.tick_interval_secs,
            ))
            .await;
        }

        self.handle_graceful_shutdown().await;
        Ok(())
    }

    /// Watchdog pass: false return means emergency shutdown was initiated
    async fn run_watchdog(&mut self) -> Result<bool> {
        let (is_fresh, reason) = self.pipeline.check_data_freshness().await;
        if is_fresh {
            return Ok(true);
        }

        let health = self.pipeline.get_health_status().await;
        warn!("[WATCHDOG] TRIGGERED: {} - attempting reconnection", reason);
        self.notifier.send_message(format!(
            "⚠️ WATCHDOG: STALE DATA\n\nReason: {}\nCoverage: {:.1}%\nFresh: {}/{}\n\nAttempting reconnection...",
            reason,
            health.data_coverage * 100.0,
            health.symbols_with_data,
            health.subscribed_symbols
        ));

        if self.pipeline.is_reconnecting() {
            info!("[WATCHDOG] Pipeline already reconnecting - letting it finish");
            return Ok(true);
        }

        if self.pipeline.reconnect().await {
            info!("[WATCHDOG] Reconnected - reconciling orders");
            // Missing SLs escalate inside reconcile_orders
            self.reconcile_orders().await?;
            self.notifier.send_message(
                "✅ WATCHDOG: reconnection successful, orders reconciled.".to_string(),
            );
            Ok(true)
        } else {
            error!("[WATCHDOG] Reconnection failed - emergency shutdown");
            self.notifier.send_message(
                "❌ WATCHDOG: reconnection FAILED\nEmergency shutdown - closing all positions."
                    .to_string(),
            );
            self.handle_emergency_shutdown().await;
            Ok(false)
        }
    }

    /// Steps f-p of the tick: snapshots, swings, filtering, order transitions,
    /// fills, position updates, daily exit, persistence
    async fn process_tick(&mut self, paused: bool) -> Result<()> {
        // f. Snapshot the pipeline once per tick
        let latest_bars = self.pipeline.get_all_latest_bars().await;
        let current_bars = self.pipeline.get_all_current_bars().await;
        if latest_bars.is_empty() {
            return Ok(());
        }

        // g. Feed strictly-newer bars into swing detection
        let mut new_bars = HashMap::new();
        for (symbol, bar) in &latest_bars {
            let newer = self
                .last_sent_bar_ts
                .get(symbol)
                .map(|ts| bar.timestamp > *ts)
                .unwrap_or(true);
            if newer {
                new_bars.insert(symbol.clone(), bar.clone());
                self.last_sent_bar_ts.insert(symbol.clone(), bar.timestamp);
            }
        }
        if !new_bars.is_empty() {
            for (symbol, swing) in self.swing_detector.update_all(&new_bars) {
                self.state
                    .save_or_warn("swing log", |s| s.log_swing(&symbol, &swing).map(|_| ()));
                if swing.swing_type == SwingType::Low {
                    self.filter.add_swing_candidate(&symbol, &swing);
                }
            }
        }

        // Stale-blocked bookkeeping: blocked symbols are released once their
        // bars resume
        let released: Vec<String> = {
            let mut released = Vec::new();
            for symbol in self.stale_blocked.iter() {
                if self
                    .pipeline
                    .has_recent_bar(symbol, self.config.max_bar_age_seconds as i64)
                    .await
                {
                    released.push(symbol.clone());
                }
            }
            released
        };
        for symbol in released {
            self.stale_blocked.remove(&symbol);
            info!("[STALE-UNBLOCK] {} bars resumed", symbol);
        }

        // A resting order on a symbol whose bars stopped flowing gets a hard
        // cancel and a block until bars resume
        let max_age = self.config.max_bar_age_seconds as i64;
        let stale_pending: Vec<(OptionType, String)> = self
            .order_manager
            .pending_entry_orders
            .iter()
            .filter(|(_, o)| (Utc::now() - o.placed_at).num_seconds() > max_age)
            .map(|(t, o)| (*t, o.symbol.clone()))
            .collect();
        for (option_type, symbol) in stale_pending {
            if !self.pipeline.has_recent_bar(&symbol, max_age).await {
                warn!(
                    "[STALE-BLOCK] {} bars stalled - cancelling {} entry",
                    symbol,
                    option_type.as_str()
                );
                self.order_manager
                    .manage_entry_for_type(option_type, None, None)
                    .await;
                self.stale_blocked.insert(symbol);
            }
        }

        // h. Evaluate all candidates, pick best CE/PE
        let open_symbols: HashSet<String> =
            self.tracker.open_positions.keys().cloned().collect();
        let pending_symbols = self.order_manager.pending_symbols();
        let best = self.filter.evaluate_all_candidates(
            &latest_bars,
            &current_bars,
            &self.swing_detector,
            &open_symbols,
            &pending_symbols,
        );

        // i. Best-strike change notifications (debounced)
        self.notify_best_strike_changes(&best);

        // j. Persist dashboard mirrors (fire-and-forget)
        self.state
            .save_or_warn("candidates", |s| s.save_swing_candidates(&self.filter.candidates));
        self.state
            .save_or_warn("latest bars", |s| s.save_latest_bars(&new_bars));
        self.state
            .save_or_warn("best strikes", |s| s.save_best_strikes(&best));

        // k. Entry order transitions per option type
        if !paused {
            self.manage_entries(&best).await?;
        }

        // l. Fill polling. Real-time (incomplete-bar) closes override the
        // sealed-bar closes in the price map.
        let prices: HashMap<String, f64> = latest_bars
            .iter()
            .map(|(s, b)| (s.clone(), b.close))
            .chain(current_bars.iter().map(|(s, b)| (s.clone(), b.close)))
            .collect();

        let fills = self.order_manager.check_entry_fills().await;
        for fill in fills {
            self.handle_order_fill(fill, &prices).await?;
        }

        // m. Position price updates
        self.tracker.update_prices(&prices);

        // n. Daily ±R exit, handled exactly once
        let was_triggered = self.tracker.daily_exit_triggered;
        if let Some(reason) = self.tracker.check_daily_exit() {
            if !was_triggered {
                self.handle_daily_exit(reason, &prices).await;
            }
        }

        // p. Persist trading state
        self.save_state();

        Ok(())
    }

    fn notify_best_strike_changes(&mut self, best: &BestStrikes) {
        for option_type in OptionType::BOTH {
            let current = best.get(option_type).map(|c| c.symbol.clone());
            let previous = self.previous_best.get(&option_type).cloned().flatten();

            match (&previous, &current) {
                (None, Some(_)) => {
                    if let Some(candidate) = best.get(option_type) {
                        self.notifier
                            .notify_best_strike_change(option_type, candidate, true);
                    }
                }
                (Some(prev), Some(curr)) if prev != curr => {
                    if let Some(candidate) = best.get(option_type) {
                        self.notifier
                            .notify_best_strike_change(option_type, candidate, false);
                    }
                }
                _ => {}
            }

            self.previous_best.insert(option_type, current);
        }
    }

    /// Step k: per option type, enforce block sets, margin and can-open
    /// policy, then drive the order-manager state machine
    async fn manage_entries(&mut self, best: &BestStrikes) -> Result<()> {
        let triggers = self
            .filter
            .get_order_triggers(best, &self.order_manager.pending_entry_orders);

        for option_type in OptionType::BOTH {
            let Some(trigger) = triggers.get(&option_type) else {
                continue;
            };

            if !matches!(trigger.action, TriggerAction::None) {
                let (symbol, price, swing_low) = trigger
                    .candidate
                    .as_ref()
                    .map(|c| (c.symbol.as_str(), c.current_price, c.swing_low))
                    .unwrap_or(("N/A", 0.0, 0.0));
                self.state.save_or_warn("order trigger", |s| {
                    s.log_order_trigger(
                        option_type,
                        trigger.action.as_str(),
                        symbol,
                        price,
                        swing_low,
                        &trigger.reason,
                    )
                });
            }

            match trigger.action {
                TriggerAction::Place | TriggerAction::Modify => {
                    let candidate = trigger.candidate.as_ref().unwrap().clone();
                    let limit_price = trigger.limit_price.unwrap();

                    // Stale-blocked and churn-blocked symbols never place
                    if self.stale_blocked.contains(&candidate.symbol)
                        || self.order_manager.churn.is_blocked(&candidate.symbol)
                    {
                        self.order_manager
                            .manage_entry_for_type(option_type, None, None)
                            .await;
                        continue;
                    }

                    // Margin pre-check: best-effort, API failures do not block
                    if !self.margin_ok(candidate.entry_price, candidate.quantity).await {
                        warn!(
                            "[MARGIN-{}] Insufficient margin for {} - cancelling slot",
                            option_type.as_str(),
                            candidate.symbol
                        );
                        self.order_manager
                            .manage_entry_for_type(option_type, None, None)
                            .await;
                        continue;
                    }

                    let pending_ce = self
                        .order_manager
                        .pending_entry_orders
                        .contains_key(&OptionType::CE) as usize;
                    let pending_pe = self
                        .order_manager
                        .pending_entry_orders
                        .contains_key(&OptionType::PE) as usize;
                    let (can_open, reason) = self.tracker.can_open_position(
                        &candidate.symbol,
                        option_type,
                        pending_ce,
                        pending_pe,
                    );

                    if !can_open {
                        warn!("[BLOCKED-{}] {}", option_type.as_str(), reason);
                        self.order_manager
                            .manage_entry_for_type(option_type, None, None)
                            .await;
                        continue;
                    }

                    let action = self
                        .order_manager
                        .manage_entry_for_type(option_type, Some(&candidate), Some(limit_price))
                        .await;
                    info!(
                        "[ORDER-{}] {} -> {}",
                        option_type.as_str(),
                        candidate.symbol,
                        action.as_str()
                    );

                    if action == EntryAction::StrategyPause {
                        error!("[CHURN] Global churn limit - asserting pause switch");
                        self.pause_switch.assert_on("churn circuit breaker");
                        self.notifier.send_message(
                            "🛑 CHURN LIMIT REACHED\nStrategy paused via PAUSE_SWITCH.\nSend /resume to continue."
                                .to_string(),
                        );
                    }
                }
                TriggerAction::Cancel => {
                    self.order_manager
                        .manage_entry_for_type(option_type, None, None)
                        .await;
                }
                TriggerAction::CheckFill | TriggerAction::Wait | TriggerAction::None => {}
            }
        }

        Ok(())
    }

    async fn margin_ok(&self, entry_price: f64, quantity: i32) -> bool {
        match self.order_broker.available_cash().await {
            Ok(cash) => {
                let required = entry_price * quantity as f64;
                cash >= required
            }
            Err(e) => {
                warn!("[MARGIN] Check failed ({}) - proceeding unverified", e);
                true
            }
        }
    }

    /// Live SL recompute at fill time: highest high since the swing including
    /// the current incomplete bar, never below the stored stale SL
    async fn compute_live_sl_price(&self, symbol: &str, fill: &Fill) -> f64 {
        let stale_sl = fill.candidate.sl_price;

        let Some(detector) = self.swing_detector.get(symbol) else {
            return stale_sl;
        };
        let Some(mut highest) = detector.highest_high_since(fill.candidate.swing_time) else {
            return stale_sl;
        };

        let current_bars = self.pipeline.get_all_current_bars().await;
        if let Some(current) = current_bars.get(symbol) {
            highest = highest.max(current.high);
        }

        let live_sl = highest + 1.0;
        if live_sl > stale_sl {
            info!(
                "[SL-RECOMPUTE] {}: stale {:.2} -> live {:.2} (highest high {:.2})",
                symbol, stale_sl, live_sl, highest
            );
            live_sl
        } else {
            stale_sl
        }
    }

    /// Entry fill: open the position, protect it with an SL, and fall back to
    /// an emergency market exit if SL placement fails
    async fn handle_order_fill(
        &mut self,
        fill: Fill,
        prices: &HashMap<String, f64>,
    ) -> Result<()> {
        // P4/I5: one processing per (symbol, order_id, fill_price)
        let key = fill.dedup_key();
        if !self.processed_fill_ids.insert(key.clone()) {
            warn!("[FILL-DEDUP] {} already processed ({})", fill.symbol, key);
            return Ok(());
        }

        info!(
            "[FILL-{}] {} @ {:.2} qty {}",
            fill.option_type.as_str(),
            fill.symbol,
            fill.fill_price,
            fill.quantity
        );

        let live_sl = self.compute_live_sl_price(&fill.symbol, &fill).await;

        let position = self.tracker.add_position(
            &fill.symbol,
            fill.fill_price,
            live_sl,
            fill.quantity,
            fill.candidate.actual_r,
            fill.candidate.clone(),
        );
        if position.is_none() {
            warn!("[FILL] {} position refused by tracker", fill.symbol);
            return Ok(());
        }

        // Filled symbols leave the candidate pool: no stacking
        self.filter.remove_candidate(&fill.symbol);

        let sl_order = self
            .order_manager
            .place_sl_order(&fill.symbol, live_sl, fill.quantity)
            .await;

        match sl_order {
            Some(order_id) => {
                info!("[SL-ORDER] {} @ {:.2} | {}", fill.symbol, live_sl, order_id);
            }
            None => {
                // Unprotected short: cap the risk immediately
                error!(
                    "[CRITICAL] SL placement FAILED for {} - emergency market exit",
                    fill.symbol
                );
                self.notifier.send_message(format!(
                    "🚨 CRITICAL: SL PLACEMENT FAILED\n\nSymbol: {}\nEntry: ₹{:.2}\nQty: {}\nExpected SL: ₹{:.2}\n\nEmergency MARKET exit...",
                    fill.symbol, fill.fill_price, fill.quantity, live_sl
                ));

                let exit = self
                    .order_manager
                    .emergency_market_exit(&fill.symbol, fill.quantity, "SL_PLACEMENT_FAILED")
                    .await;

                match exit {
                    Some(order_id) => {
                        self.notifier.send_message(format!(
                            "✅ Emergency exit placed for {} (order {})",
                            fill.symbol, order_id
                        ));
                        let exit_price = prices.get(&fill.symbol).copied().unwrap_or(fill.fill_price);
                        if let Some(closed) = self.tracker.close_position(
                            &fill.symbol,
                            exit_price,
                            "EMERGENCY_EXIT_SL_FAILED",
                        ) {
                            let trade_date = self.session.trade_date(Utc::now());
                            self.state
                                .save_or_warn("trade log", |s| s.log_trade(&closed, &trade_date));
                        }
                    }
                    None => {
                        error!(
                            "[CRITICAL] EMERGENCY EXIT FAILED for {} - MANUAL INTERVENTION REQUIRED",
                            fill.symbol
                        );
                        self.notifier.send_message(format!(
                            "❌ EMERGENCY EXIT FAILED\n\nSymbol: {}\nQty: {}\n\n🚨 Position has NO STOP LOSS - close at broker immediately!",
                            fill.symbol, fill.quantity
                        ));
                    }
                }

                if self.order_manager.should_halt_trading() {
                    error!("[HALT] Repeated SL failures - emergency shutdown");
                    self.notifier.send_message(format!(
                        "🛑 TRADING HALTED\n\n{} consecutive SL failures.\nEmergency shutdown initiated.",
                        self.order_manager.consecutive_sl_failures()
                    ));
                    self.handle_emergency_shutdown().await;
                    return Err(TradingError::RepeatedSlFailures(
                        self.order_manager.consecutive_sl_failures(),
                    ));
                }

                return Ok(());
            }
        }

        self.notifier.notify_trade_entry(&fill);
        Ok(())
    }

    /// ±R daily exit: cancel everything, clear pools, close at market
    async fn handle_daily_exit(&mut self, reason: DailyExitReason, prices: &HashMap<String, f64>) {
        warn!("DAILY EXIT TRIGGERED: {}", reason.as_str());

        self.order_manager.cancel_all_orders().await;
        self.filter.reset_daily_data();
        self.close_all_at_market(reason.as_str(), prices).await;
        self.save_state();

        let summary = self.tracker.get_position_summary();
        self.state
            .save_or_warn("daily state", |s| s.save_daily_state(&summary));
        self.notifier.notify_daily_target(&summary);

        info!("Trading stopped for the day: {:?}", summary);
    }

    /// 3:15 PM forced exit; the loop keeps monitoring until market close
    async fn handle_eod_exit(&mut self) {
        let latest = self.pipeline.get_all_latest_bars().await;
        let prices: HashMap<String, f64> =
            latest.iter().map(|(s, b)| (s.clone(), b.close)).collect();

        self.order_manager.cancel_all_orders().await;
        self.filter.reset_daily_data();
        self.close_all_at_market("EOD_EXIT", &prices).await;
        self.tracker.trigger_daily_exit(DailyExitReason::Eod);
        self.save_state();

        let summary = self.tracker.get_position_summary();
        self.state
            .save_or_warn("daily state", |s| s.save_daily_state(&summary));
        self.notifier.notify_daily_summary(&summary);
    }

    /// Close every open position with broker market orders, then locally
    async fn close_all_at_market(&mut self, reason: &str, prices: &HashMap<String, f64>) {
        let positions: Vec<(String, i32)> = self
            .tracker
            .open_positions
            .iter()
            .map(|(s, p)| (s.clone(), p.quantity))
            .collect();

        for (symbol, quantity) in positions {
            self.order_manager.cancel_sl_order(&symbol).await;
            let placed = self.order_manager.market_exit(&symbol, quantity, reason).await;
            if placed.is_none() {
                warn!(
                    "[{}] Market exit not placed for {} (flat at broker or failed)",
                    reason, symbol
                );
            }

            let exit_price = prices
                .get(&symbol)
                .copied()
                .or_else(|| self.tracker.open_positions.get(&symbol).map(|p| p.current_price))
                .unwrap_or(0.0);
            if let Some(closed) = self.tracker.close_position(&symbol, exit_price, reason) {
                let trade_date = self.session.trade_date(Utc::now());
                self.state
                    .save_or_warn("trade log", |s| s.log_trade(&closed, &trade_date));
                self.notifier.notify_trade_exit(&closed, reason);
            }
        }
    }

    fn save_state(&self) {
        self.state
            .save_or_warn("positions", |s| s.save_positions(&self.tracker.open_positions));
        self.state.save_or_warn("orders", |s| {
            s.save_orders(
                &self.order_manager.pending_entry_orders,
                &self.order_manager.active_sl_orders,
            )
        });
        let summary = self.tracker.get_position_summary();
        self.state
            .save_or_warn("daily state", |s| s.save_daily_state(&summary));
    }

    async fn log_heartbeat(&self) {
        let health = self.pipeline.get_health_status().await;
        let (candidates, ce, pe) = self.filter.summary();
        info!(
            "[HEARTBEAT] Positions: {} | Candidates: {} (CE {}, PE {}) | Data: {}/{} ({:.1}%) via {}",
            self.tracker.open_positions.len(),
            candidates,
            ce,
            pe,
            health.symbols_with_data,
            health.subscribed_symbols,
            health.data_coverage * 100.0,
            health.active_source.as_str()
        );

        let mut status = self.status_text.write().await;
        *status = format!(
            "Positions: {} | Cumulative R: {:+.2} | Coverage: {:.0}% | Feed: {}",
            self.tracker.open_positions.len(),
            self.tracker.cumulative_r,
            health.data_coverage * 100.0,
            health.active_source.as_str()
        );
    }

    // ── Shutdown ──────────────────────────────────────────────────────

    async fn handle_graceful_shutdown(&mut self) {
        info!("Initiating graceful shutdown (timeout {}s)...", SHUTDOWN_TIMEOUT_SECS);
        let _ = self
            .state
            .update_operational_state(OperationalState::Shutdown, None);

        let shutdown = async {
            for option_type in OptionType::BOTH {
                self.order_manager
                    .manage_entry_for_type(option_type, None, None)
                    .await;
            }
            self.save_state();
            self.pipeline.disconnect().await;
        };

        match tokio::time::timeout(
            std::time::Duration::from_secs(SHUTDOWN_TIMEOUT_SECS),
            shutdown,
        )
        .await
        {
            Ok(()) => info!("Shutdown complete"),
            Err(_) => {
                error!("Shutdown timed out - forcing exit");
                std::process::exit(1);
            }
        }
    }

    /// Cancel everything and force-close every position at market
    async fn handle_emergency_shutdown(&mut self) {
        error!("[EMERGENCY] INITIATING EMERGENCY SHUTDOWN");
        let _ = self
            .state
            .update_operational_state(OperationalState::Error, Some("emergency shutdown"));

        self.order_manager.cancel_all_orders().await;

        let positions: Vec<(String, i32, f64)> = self
            .tracker
            .open_positions
            .iter()
            .map(|(s, p)| (s.clone(), p.quantity, p.current_price))
            .collect();

        for (symbol, quantity, current_price) in positions {
            let placed = self
                .order_manager
                .emergency_market_exit(&symbol, quantity, "EMERGENCY_SHUTDOWN")
                .await;

            if placed.is_some() {
                if let Some(closed) =
                    self.tracker
                        .close_position(&symbol, current_price, "EMERGENCY_SHUTDOWN")
                {
                    let trade_date = self.session.trade_date(Utc::now());
                    self.state
                        .save_or_warn("trade log", |s| s.log_trade(&closed, &trade_date));
                }
            } else {
                error!(
                    "[EMERGENCY] Could not exit {} - MANUAL BROKER INTERVENTION REQUIRED",
                    symbol
                );
            }
        }

        self.tracker.trigger_daily_exit(DailyExitReason::Emergency);
        self.save_state();

        let summary = self.tracker.get_position_summary();
        self.notifier.send_message(format!(
            "🚨 EMERGENCY SHUTDOWN\n\nCumulative R: {:+.2}R\nClosed: {}\n\n⚠️ Verify broker positions manually!",
            summary.cumulative_r, summary.closed_positions
        ));

        error!("Emergency shutdown complete - verify broker positions manually");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

    let config = Arc::new(load_config(&config_path)?);

    tracing_subscriber::fmt()
        .with_env_filter(format!("swingbreak={}", config.log_level))
        .init();

    let mut app = TradingApp::new(Arc::clone(&config))?;

    match app.run().await {
        Ok(()) => Ok(()),
        Err(e) if e.is_fatal() => {
            error!("Permanent error: {}", e);
            std::process::exit(1);
        }
        Err(e) => {
            error!("Fatal runtime error: {} ({})", e, e.error_code());
            std::process::exit(2);
        }
    }
}
