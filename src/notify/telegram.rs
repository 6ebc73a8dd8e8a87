/// Telegram notifications for live trading
use chrono_tz::Asia::Kolkata;
use reqwest::Client;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::types::{Candidate, Fill, OptionType, Position, PositionSummary, Swing};

/// Sends operator alerts through a Telegram bot. Every message is prefixed
/// with the instance tag so multiple deployments stay distinguishable.
/// Sends are fire-and-forget on a spawned task; the disabled flag
/// short-circuits everything to a no-op.
pub struct TelegramNotifier {
    enabled: bool,
    bot_token: String,
    chat_id: String,
    instance_name: String,
    client: Client,
}

impl TelegramNotifier {
    pub fn new(config: &Config) -> Self {
        let mut enabled = config.telegram_enabled;
        if enabled && (config.telegram_bot_token.is_empty() || config.telegram_chat_id.is_empty())
        {
            warn!("Telegram enabled but token/chat_id not configured - disabling");
            enabled = false;
        }

        if enabled {
            info!(
                "Telegram notifications enabled (instance: {})",
                config.instance_name
            );
        }

        TelegramNotifier {
            enabled,
            bot_token: config.telegram_bot_token.clone(),
            chat_id: config.telegram_chat_id.clone(),
            instance_name: config.instance_name.clone(),
            client: Client::new(),
        }
    }

    /// No-op notifier for tests and standalone tools
    pub fn disabled(instance_name: &str) -> Self {
        TelegramNotifier {
            enabled: false,
            bot_token: String::new(),
            chat_id: String::new(),
            instance_name: instance_name.to_string(),
            client: Client::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Fire-and-forget send. Never blocks the caller and never propagates
    /// transport errors.
    pub fn send_message(&self, message: String) {
        if !self.enabled {
            debug!("[TELEGRAM-DISABLED] {}", message.lines().next().unwrap_or(""));
            return;
        }

        let tagged = format!("[{}]\n{}", self.instance_name, message);
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let chat_id = self.chat_id.clone();
        let client = self.client.clone();

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("Telegram send skipped: no async runtime");
            return;
        };

        handle.spawn(async move {
            let body = serde_json::json!({
                "chat_id": chat_id,
                "text": tagged,
            });
            match client.post(&url).json(&body).send().await {
                Ok(response) if !response.status().is_success() => {
                    warn!("Telegram send failed: HTTP {}", response.status());
                }
                Err(e) => warn!("Telegram send failed: {}", e),
                _ => {}
            }
        });
    }

    pub fn notify_trade_entry(&self, fill: &Fill) {
        self.send_message(format!(
            "🔴 SHORT ENTRY\n\n\
             Symbol: {}\n\
             Fill: ₹{:.2}\n\
             Qty: {}\n\
             SL: ₹{:.2}\n\
             Risk: ₹{:.0}",
            fill.symbol,
            fill.fill_price,
            fill.quantity,
            fill.candidate.sl_price,
            fill.candidate.actual_r,
        ));
    }

    pub fn notify_trade_exit(&self, position: &Position, exit_reason: &str) {
        self.send_message(format!(
            "🟢 POSITION CLOSED\n\n\
             Symbol: {}\n\
             Entry: ₹{:.2} -> Exit: ₹{:.2}\n\
             P&L: ₹{:+.0} ({:+.2}R)\n\
             Reason: {}",
            position.symbol,
            position.entry_price,
            position.exit_price.unwrap_or(position.current_price),
            position.realized_pnl,
            position.realized_r,
            exit_reason,
        ));
    }

    pub fn notify_daily_target(&self, summary: &PositionSummary) {
        self.send_message(format!(
            "🎯 DAILY EXIT: {}\n\n\
             Cumulative R: {:+.2}R\n\
             Total P&L: ₹{:+.0}\n\
             Closed positions: {}\n\n\
             Trading stopped for the day.",
            summary.daily_exit_reason.as_deref().unwrap_or("?"),
            summary.cumulative_r,
            summary.total_pnl,
            summary.closed_positions,
        ));
    }

    pub fn notify_daily_summary(&self, summary: &PositionSummary) {
        self.send_message(format!(
            "📊 DAILY SUMMARY ({})\n\n\
             Cumulative R: {:+.2}R\n\
             Total P&L: ₹{:+.0}\n\
             Trades closed: {}\n\
             Still open: {}",
            summary.trade_date,
            summary.cumulative_r,
            summary.total_pnl,
            summary.closed_positions,
            summary.open_positions,
        ));
    }

    pub fn notify_best_strike_change(
        &self,
        option_type: OptionType,
        candidate: &Candidate,
        is_new: bool,
    ) {
        let flavor = if is_new { "selected" } else { "changed to" };
        self.send_message(format!(
            "🎯 Best {} {} {}\n\n\
             Entry: ₹{:.2}\n\
             SL: ₹{:.2} ({:.1} pts, {:.1}%)\n\
             VWAP premium: {:.1}%\n\
             Lots: {}",
            option_type.as_str(),
            flavor,
            candidate.symbol,
            candidate.entry_price,
            candidate.sl_price,
            candidate.sl_points,
            candidate.sl_percent * 100.0,
            candidate.vwap_premium * 100.0,
            candidate.lots,
        ));
    }

    pub fn notify_swing_detected(&self, symbol: &str, swing: &Swing) {
        self.send_message(format!(
            "〽️ Swing {} on {}\n\
             Price: ₹{:.2} @ {}\n\
             VWAP: ₹{:.2}",
            swing.swing_type.as_str(),
            symbol,
            swing.price,
            swing.timestamp.with_timezone(&Kolkata).format("%H:%M"),
            swing.vwap,
        ));
    }

    pub fn notify_error(&self, error_msg: &str) {
        self.send_message(format!("❌ ERROR\n\n{}", error_msg));
    }

    pub fn notify_position_update(&self, summary: &PositionSummary) {
        self.send_message(format!(
            "📈 POSITION UPDATE\n\n\
             Open: {} (CE {}, PE {})\n\
             Cumulative R: {:+.2}R\n\
             P&L: ₹{:+.0}",
            summary.open_positions,
            summary.open_ce,
            summary.open_pe,
            summary.cumulative_r,
            summary.total_pnl,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_notifier_is_noop() {
        let n = TelegramNotifier::disabled("TEST");
        assert!(!n.is_enabled());
        // Must not panic outside a runtime
        n.send_message("hello".to_string());
    }

    #[test]
    fn test_enabled_requires_credentials() {
        let mut cfg: Config = toml::from_str("").unwrap();
        cfg.telegram_enabled = true;
        // Missing token/chat_id downgrades to disabled
        let n = TelegramNotifier::new(&cfg);
        assert!(!n.is_enabled());
    }
}
