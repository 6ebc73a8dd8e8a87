/// Dual-feed data pipeline: ticks to 1-min bars with transparent failover
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerApi, FeedSource, FeedTick, QuoteFeed};
use crate::config::Config;
use crate::error::Result;
use crate::notify::TelegramNotifier;
use crate::time::{floor_to_minute, MarketSession};
use crate::types::{Bar, Tick};

/// Session VWAP accumulator (cumulative from market open)
#[derive(Debug, Clone, Copy, Default)]
struct VwapAccumulator {
    cum_pv: f64,
    cum_vol: i64,
}

impl VwapAccumulator {
    fn add_bar(&mut self, bar: &Bar) -> f64 {
        self.cum_pv += bar.typical_price() * bar.volume as f64;
        self.cum_vol += bar.volume;
        if self.cum_vol > 0 {
            self.cum_pv / self.cum_vol as f64
        } else {
            bar.typical_price()
        }
    }
}

/// Pipeline health snapshot for heartbeats and watchdog alerts
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub subscribed_symbols: usize,
    pub symbols_with_data: usize,
    pub data_coverage: f64,
    pub stale_symbols: usize,
    pub active_source: FeedSource,
}

/// All shared pipeline state behind one lock. Reads hand out clones so
/// callers never hold references into pipeline internals.
struct PipelineState {
    bars: HashMap<String, Vec<Bar>>,
    current_bars: HashMap<String, Bar>,
    /// Last tick time per symbol for the ACTIVE source
    last_tick_time: HashMap<String, DateTime<Utc>>,
    /// Shadow map: primary-feed tick times regardless of active source,
    /// needed for switchback
    last_primary_tick_time: HashMap<String, DateTime<Utc>>,
    /// When each symbol's latest completed bar was RECEIVED (not bar time)
    last_bar_received: HashMap<String, DateTime<Utc>>,
    session_vwap: HashMap<String, VwapAccumulator>,
    subscribed_symbols: Vec<String>,
    active_source: FeedSource,
    first_data_received_at: Option<DateTime<Utc>>,
    subscription_started_at: Option<DateTime<Utc>>,
    /// History backfill failed its confidence check; VWAP comes from
    /// exchange ATP carried on ticks
    vwap_from_websocket: bool,
    vwap_websocket_applied: HashSet<String>,
    consecutive_stale_checks: u32,
    monitor_low_coverage_checks: u32,
    /// Set while on backup after a failover
    is_failover_active: bool,
    /// When primary ticks resumed flowing continuously (switchback timer)
    primary_continuous_tick_start: Option<DateTime<Utc>>,
    gap_fill_done: bool,
}

impl PipelineState {
    fn new() -> Self {
        PipelineState {
            bars: HashMap::new(),
            current_bars: HashMap::new(),
            last_tick_time: HashMap::new(),
            last_primary_tick_time: HashMap::new(),
            last_bar_received: HashMap::new(),
            session_vwap: HashMap::new(),
            subscribed_symbols: Vec::new(),
            active_source: FeedSource::Primary,
            first_data_received_at: None,
            subscription_started_at: None,
            vwap_from_websocket: false,
            vwap_websocket_applied: HashSet::new(),
            consecutive_stale_checks: 0,
            monitor_low_coverage_checks: 0,
            is_failover_active: false,
            primary_continuous_tick_start: None,
            gap_fill_done: false,
        }
    }
}

pub struct DataPipeline {
    config: Arc<Config>,
    session: MarketSession,
    broker: Arc<dyn BrokerApi>,
    primary: Arc<QuoteFeed>,
    backup: Arc<QuoteFeed>,
    notifier: Arc<TelegramNotifier>,
    state: Arc<RwLock<PipelineState>>,
    is_reconnecting: Arc<AtomicBool>,
    monitor_running: Arc<AtomicBool>,
    tick_rx: RwLock<Option<mpsc::UnboundedReceiver<FeedTick>>>,
}

impl DataPipeline {
    pub fn new(
        config: Arc<Config>,
        session: MarketSession,
        broker: Arc<dyn BrokerApi>,
        notifier: Arc<TelegramNotifier>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let primary = Arc::new(QuoteFeed::new(
            FeedSource::Primary,
            config.primary_ws_url.clone(),
            config.broker_api_key.clone(),
            tx.clone(),
        ));
        let backup = Arc::new(QuoteFeed::new(
            FeedSource::Backup,
            config.backup_ws_url.clone(),
            config.broker_api_key.clone(),
            tx,
        ));

        DataPipeline {
            config,
            session,
            broker,
            primary,
            backup,
            notifier,
            state: Arc::new(RwLock::new(PipelineState::new())),
            is_reconnecting: Arc::new(AtomicBool::new(false)),
            monitor_running: Arc::new(AtomicBool::new(false)),
            tick_rx: RwLock::new(Some(rx)),
        }
    }

    /// Connect the primary feed
    pub async fn connect(&self) -> Result<()> {
        self.primary.connect().await
    }

    /// Connect the backup feed (silent standby)
    pub async fn connect_backup(&self) -> Result<()> {
        match self.backup.connect().await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Backup is best-effort at startup; primary alone is viable
                warn!("[BACKUP] Backup feed connection failed: {}", e);
                Err(e)
            }
        }
    }

    /// Subscribe both feeds to the instrument universe
    pub async fn subscribe(&self, symbols: &[String]) -> Result<()> {
        self.primary.subscribe_quote(symbols).await?;

        if self.backup.is_connected().await {
            if let Err(e) = self.backup.subscribe_quote(symbols).await {
                warn!("[BACKUP] Backup subscribe failed: {}", e);
            }
        }

        let mut state = self.state.write().await;
        state.subscribed_symbols = symbols.to_vec();
        state.subscription_started_at = Some(Utc::now());
        Ok(())
    }

    /// Start routing feed ticks into bar construction. Call once.
    pub async fn start_tick_router(self: &Arc<Self>) {
        let mut rx = {
            let mut guard = self.tick_rx.write().await;
            guard.take().expect("tick router already started")
        };

        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(feed_tick) = rx.recv().await {
                pipeline.process_tick(feed_tick.source, &feed_tick.tick).await;
            }
            warn!("[PIPELINE] Tick router ended");
        });

        info!("[PIPELINE] Tick router started");
    }

    /// Core tick processing: aggregates active-source ticks into 1-min bars.
    /// Primary ticks always refresh the shadow map; non-active ticks are
    /// otherwise discarded.
    pub async fn process_tick(&self, source: FeedSource, tick: &Tick) {
        let now = tick.timestamp;
        let bar_timestamp = floor_to_minute(now);

        let mut state = self.state.write().await;

        if source == FeedSource::Primary {
            state
                .last_primary_tick_time
                .insert(tick.symbol.clone(), now);
        }

        if source != state.active_source {
            return;
        }

        state.last_tick_time.insert(tick.symbol.clone(), now);
        if state.first_data_received_at.is_none() {
            state.first_data_received_at = Some(now);
        }

        // ATP fallback: first tick for a symbol patches all historical VWAPs
        if state.vwap_from_websocket
            && tick.average_price > 0.0
            && !state.vwap_websocket_applied.contains(&tick.symbol)
        {
            if let Some(bars) = state.bars.get_mut(&tick.symbol) {
                for bar in bars.iter_mut() {
                    bar.vwap = tick.average_price;
                }
                info!(
                    "[VWAP-ATP] {}: patched {} historical bars with exchange ATP {:.2}",
                    tick.symbol,
                    bars.len(),
                    tick.average_price
                );
            }
            state.vwap_websocket_applied.insert(tick.symbol.clone());
        }

        let rollover = match state.current_bars.get(&tick.symbol) {
            Some(bar) => bar.timestamp != bar_timestamp,
            None => true,
        };

        if rollover {
            // Seal the completed bar
            if let Some(mut completed) = state.current_bars.remove(&tick.symbol) {
                if completed.is_valid() {
                    if state.vwap_from_websocket && tick.average_price > 0.0 {
                        completed.vwap = tick.average_price;
                    } else {
                        let acc = state
                            .session_vwap
                            .entry(tick.symbol.clone())
                            .or_default();
                        completed.vwap = acc.add_bar(&completed);
                    }

                    if tick.average_price > 0.0 {
                        completed.atp = tick.average_price;
                    }

                    debug!(
                        "[BAR] {} | O:{:.2} H:{:.2} L:{:.2} C:{:.2} V:{}",
                        tick.symbol,
                        completed.open,
                        completed.high,
                        completed.low,
                        completed.close,
                        completed.volume
                    );

                    let max_bars = self.config.max_bars_per_symbol;
                    let prune_at = self.config.bar_pruning_threshold;
                    let series = state.bars.entry(tick.symbol.clone()).or_default();
                    series.push(completed);
                    if series.len() > prune_at {
                        let removed = series.len() - max_bars;
                        series.drain(0..removed);
                        debug!("Pruned {} old bars from {}", removed, tick.symbol);
                    }
                    state
                        .last_bar_received
                        .insert(tick.symbol.clone(), Utc::now());
                }
            }

            state
                .current_bars
                .insert(tick.symbol.clone(), Bar::new(bar_timestamp, tick.ltp, tick.volume));
        } else if let Some(bar) = state.current_bars.get_mut(&tick.symbol) {
            bar.update_tick(tick.ltp, tick.volume);
        }

        // Keep the in-progress bar's VWAP current under ATP fallback so the
        // filter sees the right value mid-bar
        if state.vwap_from_websocket && tick.average_price > 0.0 {
            if let Some(bar) = state.current_bars.get_mut(&tick.symbol) {
                bar.vwap = tick.average_price;
            }
        }
    }

    // ── History backfill ──────────────────────────────────────────────

    /// Load today's 1-min bars from market open to the last fully-closed
    /// minute. The in-progress minute is excluded: keeping it would run swing
    /// detection on partial data and then reject the live bar as a duplicate.
    pub async fn load_historical_data(&self, symbols: &[String]) -> Result<()> {
        info!("[HIST] Loading historical data for {} symbols...", symbols.len());

        let now = Utc::now();
        let today = self.session.trade_date(now);
        let last_complete = floor_to_minute(now) - Duration::minutes(1);

        let mut successful = 0usize;
        let mut failed = 0usize;

        for symbol in symbols {
            match self
                .broker
                .history(symbol, "1m", &today, &today)
                .await
            {
                Ok(rows) => {
                    let mut acc = VwapAccumulator::default();
                    let mut series: Vec<Bar> = Vec::with_capacity(rows.len());

                    for row in rows {
                        let ts = floor_to_minute(row.timestamp);
                        if ts > last_complete {
                            continue;
                        }
                        let mut bar = Bar {
                            timestamp: ts,
                            open: row.open,
                            high: row.high,
                            low: row.low,
                            close: row.close,
                            volume: row.volume,
                            vwap: 0.0,
                            atp: 0.0,
                            tick_count: 10,
                        };
                        bar.vwap = acc.add_bar(&bar);
                        series.push(bar);
                    }

                    let mut state = self.state.write().await;
                    state.session_vwap.insert(symbol.clone(), acc);
                    state.bars.insert(symbol.clone(), series);
                    successful += 1;
                }
                Err(e) => {
                    error!("[HIST] Failed to load history for {}: {}", symbol, e);
                    failed += 1;
                }
            }
        }

        info!("[HIST] Historical data loaded: {} success, {} failed", successful, failed);

        self.ensure_complete_history(now).await;
        Ok(())
    }

    /// Verify the backfill captured bars from close to market open. The
    /// intraday history API can lag shortly after open and return far fewer
    /// bars than expected. Retries up to 3 times (60 s apart); if still short,
    /// activates the WebSocket ATP fallback.
    async fn ensure_complete_history(&self, load_time: DateTime<Utc>) {
        let open = self.session.open_at(load_time);
        if load_time <= open {
            return;
        }

        let expected = ((load_time - open).num_minutes() - 1).max(0) as usize;
        if expected < 5 {
            return;
        }

        let max_bars = self.max_loaded_bars().await;
        if max_bars as f64 >= expected as f64 * 0.8 {
            info!(
                "[HIST] Bar count OK: {}/{} bars loaded (>= 80% threshold)",
                max_bars, expected
            );
            return;
        }

        warn!(
            "[HIST] Incomplete history: {}/{} bars (< 80%). Retrying up to 3 times before ATP fallback.",
            max_bars, expected
        );

        for attempt in 1..=3u32 {
            info!("[HIST-RETRY] Waiting 60s before attempt {}/3...", attempt);
            tokio::time::sleep(tokio::time::Duration::from_secs(60)).await;

            let symbols = {
                let state = self.state.read().await;
                state.subscribed_symbols.clone()
            };
            if let Err(e) = self.load_reload_pass(&symbols).await {
                error!("[HIST-RETRY] Reload error: {}", e);
            }

            let now = Utc::now();
            let expected_now =
                ((now - self.session.open_at(now)).num_minutes() - 1).max(0) as usize;
            let max_bars = self.max_loaded_bars().await;

            info!(
                "[HIST-RETRY] Attempt {}/3: {}/{} bars after reload",
                attempt, max_bars, expected_now
            );

            if max_bars as f64 >= expected_now as f64 * 0.8 {
                info!("[HIST-RETRY] History complete after attempt {}", attempt);
                return;
            }
        }

        let mut state = self.state.write().await;
        state.vwap_from_websocket = true;
        warn!(
            "[HIST-RETRY] All retries failed. WebSocket ATP fallback active; \
             bar VWAPs will be patched on first tick per symbol."
        );
    }

    /// One reload pass: refetch history, insert missing early bars, and
    /// recompute cumulative VWAP across everything now in memory.
    async fn load_reload_pass(&self, symbols: &[String]) -> Result<()> {
        let now = Utc::now();
        let today = self.session.trade_date(now);
        let last_complete = floor_to_minute(now) - Duration::minutes(1);

        for symbol in symbols {
            let rows = match self.broker.history(symbol, "1m", &today, &today).await {
                Ok(rows) => rows,
                Err(_) => continue,
            };

            let mut state = self.state.write().await;
            let existing: HashSet<DateTime<Utc>> = state
                .bars
                .get(symbol)
                .map(|bars| bars.iter().map(|b| b.timestamp).collect())
                .unwrap_or_default();

            let mut acc = VwapAccumulator::default();
            let mut vwap_by_ts: HashMap<DateTime<Utc>, f64> = HashMap::new();
            let mut early_bars: Vec<Bar> = Vec::new();

            for row in &rows {
                let ts = floor_to_minute(row.timestamp);
                if ts > last_complete {
                    continue;
                }
                let mut bar = Bar {
                    timestamp: ts,
                    open: row.open,
                    high: row.high,
                    low: row.low,
                    close: row.close,
                    volume: row.volume,
                    vwap: 0.0,
                    atp: 0.0,
                    tick_count: 10,
                };
                bar.vwap = acc.add_bar(&bar);
                vwap_by_ts.insert(ts, bar.vwap);
                if !existing.contains(&ts) {
                    early_bars.push(bar);
                }
            }

            let series = state.bars.entry(symbol.clone()).or_default();
            if !early_bars.is_empty() {
                info!(
                    "[HIST-RETRY] {}: inserted {} bars missed on first load",
                    symbol,
                    early_bars.len()
                );
                series.extend(early_bars);
                series.sort_by_key(|b| b.timestamp);
            }

            // Patch VWAP on every bar; live bars not in the API yet carry
            // the last known value forward
            let mut last_known = None;
            for bar in series.iter_mut() {
                if let Some(v) = vwap_by_ts.get(&bar.timestamp) {
                    bar.vwap = *v;
                    last_known = Some(*v);
                } else if let Some(v) = last_known {
                    bar.vwap = v;
                }
            }

            state.session_vwap.insert(symbol.clone(), acc);
        }

        Ok(())
    }

    /// One-shot gap fill between the last historical bar and now, run after
    /// live mode starts
    pub async fn fill_initial_gap(&self) -> Result<()> {
        {
            let state = self.state.read().await;
            if state.gap_fill_done {
                return Ok(());
            }
        }

        let now = Utc::now();
        let today = self.session.trade_date(now);
        let last_complete = floor_to_minute(now) - Duration::minutes(1);

        let targets: Vec<(String, Option<DateTime<Utc>>)> = {
            let state = self.state.read().await;
            state
                .subscribed_symbols
                .iter()
                .map(|s| {
                    (
                        s.clone(),
                        state.bars.get(s).and_then(|b| b.last()).map(|b| b.timestamp),
                    )
                })
                .collect()
        };

        let mut filled = 0usize;
        for (symbol, last_ts) in targets {
            let needs_fill = match last_ts {
                Some(ts) => ts < last_complete,
                None => false, // no history at all; live stream will build bars
            };
            if !needs_fill {
                continue;
            }

            let rows = match self.broker.history(&symbol, "1m", &today, &today).await {
                Ok(rows) => rows,
                Err(e) => {
                    debug!("[GAP-FILL] {}: history fetch failed: {}", symbol, e);
                    continue;
                }
            };

            let mut state = self.state.write().await;
            let floor = last_ts.unwrap();
            let mut appended = 0usize;
            for row in rows {
                let ts = floor_to_minute(row.timestamp);
                if ts <= floor || ts > last_complete {
                    continue;
                }
                let mut bar = Bar {
                    timestamp: ts,
                    open: row.open,
                    high: row.high,
                    low: row.low,
                    close: row.close,
                    volume: row.volume,
                    vwap: 0.0,
                    atp: 0.0,
                    tick_count: 10,
                };
                let acc = state.session_vwap.entry(symbol.clone()).or_default();
                bar.vwap = acc.add_bar(&bar);
                state.bars.entry(symbol.clone()).or_default().push(bar);
                appended += 1;
            }
            if appended > 0 {
                state.last_bar_received.insert(symbol.clone(), Utc::now());
                filled += appended;
            }
        }

        let mut state = self.state.write().await;
        state.gap_fill_done = true;
        info!("[GAP-FILL] Filled {} missing bars", filled);
        Ok(())
    }

    async fn max_loaded_bars(&self) -> usize {
        let state = self.state.read().await;
        state.bars.values().map(Vec::len).max().unwrap_or(0)
    }

    // ── Snapshots (defensive copies) ──────────────────────────────────

    /// Latest completed bar per symbol
    pub async fn get_all_latest_bars(&self) -> HashMap<String, Bar> {
        let state = self.state.read().await;
        state
            .bars
            .iter()
            .filter_map(|(symbol, bars)| bars.last().map(|b| (symbol.clone(), b.clone())))
            .collect()
    }

    /// Current (incomplete) bar per symbol
    pub async fn get_all_current_bars(&self) -> HashMap<String, Bar> {
        let state = self.state.read().await;
        state
            .current_bars
            .iter()
            .map(|(symbol, bar)| (symbol.clone(), bar.clone()))
            .collect()
    }

    /// Full bar history for one symbol
    pub async fn get_bars_for_symbol(&self, symbol: &str) -> Vec<Bar> {
        let state = self.state.read().await;
        state.bars.get(symbol).cloned().unwrap_or_default()
    }

    pub async fn get_health_status(&self) -> HealthStatus {
        let state = self.state.read().await;
        let now = Utc::now();
        let max_age = self.config.max_tick_age_secs as i64;

        let total = state.subscribed_symbols.len();
        let fresh = state
            .subscribed_symbols
            .iter()
            .filter(|s| {
                state
                    .last_tick_time
                    .get(*s)
                    .map(|t| (now - *t).num_seconds() <= max_age)
                    .unwrap_or(false)
            })
            .count();

        HealthStatus {
            subscribed_symbols: total,
            symbols_with_data: fresh,
            data_coverage: if total > 0 {
                fresh as f64 / total as f64
            } else {
                0.0
            },
            stale_symbols: total - fresh,
            active_source: state.active_source,
        }
    }

    /// Whether a symbol's latest completed bar is fresh again (stale-block
    /// release check)
    pub async fn has_recent_bar(&self, symbol: &str, max_age_secs: i64) -> bool {
        let state = self.state.read().await;
        state
            .last_bar_received
            .get(symbol)
            .map(|t| (Utc::now() - *t).num_seconds() <= max_age_secs)
            .unwrap_or(false)
    }

    // ── Watchdog ──────────────────────────────────────────────────────

    /// Freshness check for the orchestrator's watchdog. Returns
    /// (is_fresh, reason_if_stale). Always fresh outside market hours.
    pub async fn check_data_freshness(&self) -> (bool, String) {
        let now = Utc::now();
        if !self.session.is_market_open(now) {
            return (true, String::new());
        }

        let mut state = self.state.write().await;

        if state.first_data_received_at.is_none() {
            return (true, String::new());
        }

        let total = state.subscribed_symbols.len();
        if total == 0 {
            return (true, String::new());
        }

        let max_age = self.config.max_tick_age_secs as i64;
        let fresh = state
            .subscribed_symbols
            .iter()
            .filter(|s| {
                state
                    .last_tick_time
                    .get(*s)
                    .map(|t| (now - *t).num_seconds() <= max_age)
                    .unwrap_or(false)
            })
            .count();
        let coverage = fresh as f64 / total as f64;

        if coverage < self.config.min_data_coverage_threshold {
            state.consecutive_stale_checks += 1;
            warn!(
                "Data coverage {:.1}% < {:.1}% ({}/{} fresh) | consecutive: {}",
                coverage * 100.0,
                self.config.min_data_coverage_threshold * 100.0,
                fresh,
                total,
                state.consecutive_stale_checks
            );
            if state.consecutive_stale_checks >= 3 {
                return (false, format!("DATA_COVERAGE_LOW:{:.1}%", coverage * 100.0));
            }
        } else {
            state.consecutive_stale_checks = 0;
        }

        if let Some(latest_tick) = state.last_tick_time.values().max() {
            let age = (now - *latest_tick).num_seconds();
            if age > self.config.stale_data_timeout_secs as i64 {
                return (false, format!("NO_FRESH_TICKS:{}s", age));
            }
        }

        if let Some(latest_bar) = state.last_bar_received.values().max() {
            let age = (now - *latest_bar).num_seconds();
            if age > self.config.max_bar_age_seconds as i64 {
                return (false, format!("STALE_BARS:{}s", age));
            }
        }

        (true, String::new())
    }

    pub async fn reset_watchdog(&self) {
        let mut state = self.state.write().await;
        state.consecutive_stale_checks = 0;
    }

    // ── Failover monitor ──────────────────────────────────────────────

    /// Start the background connection monitor (coarse ~10 s cadence)
    pub async fn start_connection_monitor(self: &Arc<Self>) {
        if self.monitor_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            info!("[MONITOR] Connection monitor started");
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(10));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                if !pipeline.monitor_running.load(Ordering::SeqCst) {
                    break;
                }
                if pipeline.is_reconnecting.load(Ordering::SeqCst) {
                    continue;
                }
                // No-op outside market hours to avoid overnight false alarms
                if !pipeline.session.is_market_open(Utc::now()) {
                    continue;
                }
                pipeline.monitor_check().await;
            }
            info!("[MONITOR] Connection monitor stopped");
        });
    }

    pub fn stop_connection_monitor(&self) {
        self.monitor_running.store(false, Ordering::SeqCst);
    }

    async fn monitor_check(&self) {
        let now = Utc::now();

        // Check 1: primary WebSocket dropped
        if !self.primary.is_connected().await {
            warn!("[MONITOR] Primary WebSocket disconnected");
            self.trigger_failover_or_reconnect("WEBSOCKET_DISCONNECTED").await;
            return;
        }

        let no_tick_threshold = self.config.failover_no_tick_threshold_secs as i64;

        enum Decision {
            Failover(String),
            Switchback,
            None,
        }

        let decision = {
            let mut state = self.state.write().await;

            if state.subscribed_symbols.is_empty() {
                Decision::None
            } else if state.first_data_received_at.is_none() {
                // Subscribed but zero ticks ever: the socket can stay "up"
                // while the session behind it is dead
                match state.subscription_started_at {
                    Some(started) => {
                        let since = (now - started).num_seconds();
                        if since > no_tick_threshold {
                            Decision::Failover(format!("NO_TICKS_SINCE_SUBSCRIBE:{}s", since))
                        } else {
                            Decision::None
                        }
                    }
                    None => Decision::None,
                }
            } else if !state.is_failover_active {
                // On primary: stale primary ticks trigger failover
                let newest = state.last_primary_tick_time.values().max().copied()
                    .or_else(|| state.last_tick_time.values().max().copied());
                match newest {
                    Some(ts) if (now - ts).num_seconds() > no_tick_threshold => {
                        Decision::Failover(format!(
                            "NO_TICKS:{}s",
                            (now - ts).num_seconds()
                        ))
                    }
                    _ => {
                        // Coverage check: three consecutive low readings
                        let total = state.subscribed_symbols.len();
                        let max_age = self.config.max_tick_age_secs as i64;
                        let fresh = state
                            .subscribed_symbols
                            .iter()
                            .filter(|s| {
                                state
                                    .last_tick_time
                                    .get(*s)
                                    .map(|t| (now - *t).num_seconds() <= max_age)
                                    .unwrap_or(false)
                            })
                            .count();
                        let coverage = fresh as f64 / total as f64;
                        if coverage < self.config.min_data_coverage_threshold {
                            state.monitor_low_coverage_checks += 1;
                            if state.monitor_low_coverage_checks >= 3 {
                                state.monitor_low_coverage_checks = 0;
                                Decision::Failover(format!(
                                    "LOW_DATA_COVERAGE:{:.1}%",
                                    coverage * 100.0
                                ))
                            } else {
                                Decision::None
                            }
                        } else {
                            state.monitor_low_coverage_checks = 0;
                            Decision::None
                        }
                    }
                }
            } else {
                // On backup: watch ONLY the primary shadow map for resumed
                // ticks. last_tick_time holds backup ticks here and would
                // falsely indicate the primary is alive.
                match state.last_primary_tick_time.values().max().copied() {
                    Some(ts) if (now - ts).num_seconds() <= no_tick_threshold => {
                        match state.primary_continuous_tick_start {
                            None => {
                                state.primary_continuous_tick_start = Some(now);
                                info!("[MONITOR] Primary ticks resumed - monitoring for switchback...");
                                Decision::None
                            }
                            Some(start) => {
                                let flowing = (now - start).num_seconds();
                                if flowing
                                    >= self.config.failover_switchback_threshold_secs as i64
                                {
                                    Decision::Switchback
                                } else {
                                    Decision::None
                                }
                            }
                        }
                    }
                    _ => {
                        state.primary_continuous_tick_start = None;
                        Decision::None
                    }
                }
            }
        };

        match decision {
            Decision::Failover(reason) => self.trigger_failover_or_reconnect(&reason).await,
            Decision::Switchback => self.switchback_to_primary().await,
            Decision::None => {}
        }
    }

    /// Primary data failed: fail over to the backup if it is connected, then
    /// reconnect the primary in the background. Without a backup, plain
    /// reconnect.
    async fn trigger_failover_or_reconnect(&self, reason: &str) {
        warn!("[MONITOR] Data failure detected: {}", reason);

        let backup_ready = self.backup.is_connected().await;
        let already_failed_over = {
            let state = self.state.read().await;
            state.is_failover_active
        };

        if backup_ready && !already_failed_over {
            self.failover_to_backup(reason).await;
        }

        // Reconnect primary in the background either way
        if !self.is_reconnecting.swap(true, Ordering::SeqCst) {
            let primary = Arc::clone(&self.primary);
            let flag = Arc::clone(&self.is_reconnecting);
            let attempts = self.config.websocket_max_reconnect_attempts;
            let delay = self.config.websocket_reconnect_delay_secs;
            tokio::spawn(async move {
                let result = primary.reconnect(attempts, delay).await;
                if let Err(e) = result {
                    error!("[MONITOR] Primary reconnect failed: {}", e);
                }
                flag.store(false, Ordering::SeqCst);
            });
        }
    }

    /// Atomic failover: flip active source, clear active tick times so backup
    /// ticks count as fresh
    async fn failover_to_backup(&self, reason: &str) {
        {
            let mut state = self.state.write().await;
            if state.is_failover_active {
                return;
            }
            state.active_source = FeedSource::Backup;
            state.is_failover_active = true;
            state.primary_continuous_tick_start = None;
            state.last_tick_time.clear();
            state.first_data_received_at = None;
        }

        warn!("[FAILOVER] Switched to backup feed. Reason: {}", reason);
        self.notifier.send_message(format!(
            "[FAILOVER] Switched to backup feed\nReason: {}\nPrimary reconnect running in background.",
            reason
        ));
    }

    /// Switchback after primary ticks have flowed continuously long enough.
    /// Restores active tick times from the primary shadow map.
    async fn switchback_to_primary(&self) {
        {
            let mut state = self.state.write().await;
            if !state.is_failover_active {
                return;
            }
            state.active_source = FeedSource::Primary;
            state.is_failover_active = false;
            state.primary_continuous_tick_start = None;
            state.last_tick_time = state.last_primary_tick_time.clone();
            state.first_data_received_at = state.last_tick_time.values().min().copied();
        }

        info!("[SWITCHBACK] Back on primary feed");
        self.notifier.send_message(
            "[SWITCHBACK] Back on primary feed\nBackup returns to standby.".to_string(),
        );
    }

    /// Bounded primary reconnect for the orchestrator's watchdog path
    pub async fn reconnect(&self) -> bool {
        if self.is_reconnecting.swap(true, Ordering::SeqCst) {
            // Pipeline already self-healing; report success so the watchdog
            // lets it finish
            return true;
        }

        let result = self
            .primary
            .reconnect(
                self.config.websocket_max_reconnect_attempts,
                self.config.websocket_reconnect_delay_secs,
            )
            .await;

        self.is_reconnecting.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                self.reset_watchdog().await;
                true
            }
            Err(e) => {
                error!("[PIPELINE] Reconnect failed: {}", e);
                false
            }
        }
    }

    pub fn is_reconnecting(&self) -> bool {
        self.is_reconnecting.load(Ordering::SeqCst)
    }

    pub async fn disconnect(&self) {
        self.stop_connection_monitor();
        self.primary.disconnect().await;
        self.backup.disconnect().await;
        info!("[PIPELINE] Disconnected");
    }

    // ── Test hooks ────────────────────────────────────────────────────

    #[cfg(test)]
    pub(crate) async fn force_subscribe_state(&self, symbols: Vec<String>) {
        let mut state = self.state.write().await;
        state.subscribed_symbols = symbols;
        state.subscription_started_at = Some(Utc::now());
    }

    #[cfg(test)]
    pub(crate) async fn force_atp_fallback(&self) {
        let mut state = self.state.write().await;
        state.vwap_from_websocket = true;
    }

    #[cfg(test)]
    pub(crate) async fn force_failover_state(&self) -> bool {
        self.failover_to_backup("test").await;
        let state = self.state.read().await;
        state.is_failover_active
    }

    #[cfg(test)]
    pub(crate) async fn active_source(&self) -> FeedSource {
        let state = self.state.read().await;
        state.active_source
    }

    #[cfg(test)]
    pub(crate) async fn test_switchback(&self) {
        self.switchback_to_primary().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::time::session_for_tests;
    use chrono::TimeZone;
    use chrono_tz::Asia::Kolkata;

    fn test_config() -> Arc<Config> {
        Arc::new(toml::from_str("").unwrap())
    }

    fn pipeline() -> Arc<DataPipeline> {
        let config = test_config();
        let session = session_for_tests();
        let notifier = Arc::new(TelegramNotifier::disabled("TEST"));
        Arc::new(DataPipeline::new(
            config,
            session,
            Arc::new(PaperBroker::new()),
            notifier,
        ))
    }

    fn tick_at(symbol: &str, h: u32, m: u32, s: u32, ltp: f64, volume: i64, atp: f64) -> Tick {
        let ts = Kolkata
            .with_ymd_and_hms(2025, 1, 30, h, m, s)
            .unwrap()
            .with_timezone(&Utc);
        Tick {
            symbol: symbol.to_string(),
            ltp,
            volume,
            average_price: atp,
            timestamp: ts,
        }
    }

    #[tokio::test]
    async fn test_minute_rollover_seals_bar_with_vwap() {
        let p = pipeline();
        let sym = "NIFTY30JAN2526000CE";

        p.process_tick(FeedSource::Primary, &tick_at(sym, 10, 0, 5, 100.0, 10, 0.0))
            .await;
        p.process_tick(FeedSource::Primary, &tick_at(sym, 10, 0, 30, 102.0, 5, 0.0))
            .await;
        // First tick of the next minute seals 10:00
        p.process_tick(FeedSource::Primary, &tick_at(sym, 10, 1, 2, 101.0, 3, 0.0))
            .await;

        let latest = p.get_all_latest_bars().await;
        let bar = latest.get(sym).unwrap();
        assert_eq!(bar.high, 102.0);
        assert_eq!(bar.low, 100.0);
        assert_eq!(bar.close, 102.0);
        assert_eq!(bar.volume, 15);
        // VWAP = typical price of the single sealed bar
        let expected_vwap = (102.0 + 100.0 + 102.0) / 3.0;
        assert!((bar.vwap - expected_vwap).abs() < 1e-9);

        let current = p.get_all_current_bars().await;
        assert_eq!(current.get(sym).unwrap().close, 101.0);
    }

    #[tokio::test]
    async fn test_bars_strictly_monotonic() {
        let p = pipeline();
        let sym = "NIFTY30JAN2526000CE";

        for minute in 0..5u32 {
            p.process_tick(
                FeedSource::Primary,
                &tick_at(sym, 10, minute, 1, 100.0 + minute as f64, 10, 0.0),
            )
            .await;
        }

        let bars = p.get_bars_for_symbol(sym).await;
        for pair in bars.windows(2) {
            assert!(pair[1].timestamp > pair[0].timestamp);
        }
    }

    #[tokio::test]
    async fn test_non_active_feed_ticks_discarded_but_shadow_updates() {
        let p = pipeline();
        let sym = "NIFTY30JAN2526000CE";

        // Backup ticks while primary is active: no bars built
        p.process_tick(FeedSource::Backup, &tick_at(sym, 10, 0, 5, 100.0, 10, 0.0))
            .await;
        assert!(p.get_all_current_bars().await.is_empty());

        // Primary ticks build bars
        p.process_tick(FeedSource::Primary, &tick_at(sym, 10, 0, 6, 100.0, 10, 0.0))
            .await;
        assert_eq!(p.get_all_current_bars().await.len(), 1);
    }

    #[tokio::test]
    async fn test_atp_fallback_patches_history_and_current() {
        let p = pipeline();
        let sym = "NIFTY30JAN2526000CE";

        // Build one sealed bar the normal way
        p.process_tick(FeedSource::Primary, &tick_at(sym, 10, 0, 5, 100.0, 10, 0.0))
            .await;
        p.process_tick(FeedSource::Primary, &tick_at(sym, 10, 1, 5, 101.0, 10, 0.0))
            .await;

        p.force_atp_fallback().await;

        // First tick carrying ATP patches all bars
        p.process_tick(FeedSource::Primary, &tick_at(sym, 10, 1, 30, 101.5, 5, 97.25))
            .await;

        let bars = p.get_bars_for_symbol(sym).await;
        assert!((bars[0].vwap - 97.25).abs() < 1e-9);
        let current = p.get_all_current_bars().await;
        assert!((current.get(sym).unwrap().vwap - 97.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_failover_clears_active_ticks_and_switchback_restores() {
        let p = pipeline();
        let sym = "NIFTY30JAN2526000CE";
        p.force_subscribe_state(vec![sym.to_string()]).await;

        p.process_tick(FeedSource::Primary, &tick_at(sym, 10, 0, 5, 100.0, 10, 0.0))
            .await;

        assert!(p.force_failover_state().await);
        assert_eq!(p.active_source().await, FeedSource::Backup);

        // Backup ticks now drive bars
        p.process_tick(FeedSource::Backup, &tick_at(sym, 10, 1, 5, 101.0, 10, 0.0))
            .await;
        assert_eq!(p.get_all_current_bars().await.len(), 1);

        // Primary shadow ticks keep arriving during failover
        p.process_tick(FeedSource::Primary, &tick_at(sym, 10, 1, 10, 101.2, 5, 0.0))
            .await;

        p.test_switchback().await;
        assert_eq!(p.active_source().await, FeedSource::Primary);
    }

    #[tokio::test]
    async fn test_bar_pruning_keeps_most_recent() {
        let mut cfg: Config = toml::from_str("").unwrap();
        cfg.max_bars_per_symbol = 5;
        cfg.bar_pruning_threshold = 8;
        let p = Arc::new(DataPipeline::new(
            Arc::new(cfg),
            session_for_tests(),
            Arc::new(PaperBroker::new()),
            Arc::new(TelegramNotifier::disabled("TEST")),
        ));
        let sym = "NIFTY30JAN2526000CE";

        for minute in 0..12u32 {
            p.process_tick(
                FeedSource::Primary,
                &tick_at(sym, 10, minute, 1, 100.0 + minute as f64, 10, 0.0),
            )
            .await;
        }

        let bars = p.get_bars_for_symbol(sym).await;
        assert!(bars.len() <= 8);
        // The newest sealed bar survives pruning
        assert_eq!(bars.last().unwrap().open, 110.0);
    }
}
