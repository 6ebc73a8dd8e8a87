/// Telegram command listener: operator control without shell access
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::state::Switch;

/// Long-polls the bot getUpdates endpoint and maps commands onto the
/// kill/pause sentinel files. Only the configured chat id is honored;
/// updates pending before startup are flushed so stale commands never fire.
pub struct TelegramCommandListener {
    bot_token: String,
    chat_id: String,
    kill: Switch,
    pause: Switch,
    client: Client,
    last_update_id: AtomicI64,
    running: Arc<AtomicBool>,
    /// Latest status line maintained by the orchestrator
    status_text: Arc<RwLock<String>>,
}

impl TelegramCommandListener {
    pub fn new(
        bot_token: String,
        chat_id: String,
        kill: Switch,
        pause: Switch,
        status_text: Arc<RwLock<String>>,
    ) -> Self {
        TelegramCommandListener {
            bot_token,
            chat_id,
            kill,
            pause,
            client: Client::new(),
            last_update_id: AtomicI64::new(0),
            running: Arc::new(AtomicBool::new(false)),
            status_text,
        }
    }

    /// Flush pending updates, then start the poll loop task
    pub async fn start(self: &Arc<Self>) {
        if self.bot_token.is_empty() || self.chat_id.is_empty() {
            info!("[COMMANDS] Listener disabled (no bot credentials)");
            return;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        self.flush_pending_updates().await;

        let listener = Arc::clone(self);
        tokio::spawn(async move {
            info!("[COMMANDS] Listener started");
            while listener.running.load(Ordering::SeqCst) {
                if let Err(e) = listener.poll_once().await {
                    warn!("[COMMANDS] Poll error: {}", e);
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                }
            }
            info!("[COMMANDS] Listener stopped");
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Discard anything queued before process start
    async fn flush_pending_updates(&self) {
        match self.get_updates(-1, 0).await {
            Ok(updates) => {
                if let Some(max_id) = updates.iter().filter_map(|u| u["update_id"].as_i64()).max()
                {
                    self.last_update_id.store(max_id, Ordering::SeqCst);
                    info!("[COMMANDS] Flushed pending updates up to {}", max_id);
                }
            }
            Err(e) => warn!("[COMMANDS] Flush failed: {}", e),
        }
    }

    async fn poll_once(&self) -> crate::error::Result<()> {
        let offset = self.last_update_id.load(Ordering::SeqCst) + 1;
        let updates = self.get_updates(offset, 25).await?;

        for update in updates {
            if let Some(id) = update["update_id"].as_i64() {
                self.last_update_id.fetch_max(id, Ordering::SeqCst);
            }

            let message = &update["message"];
            let from_chat = message["chat"]["id"]
                .as_i64()
                .map(|id| id.to_string())
                .or_else(|| message["chat"]["id"].as_str().map(str::to_string));

            if from_chat.as_deref() != Some(self.chat_id.as_str()) {
                debug!("[COMMANDS] Ignoring update from foreign chat");
                continue;
            }

            if let Some(text) = message["text"].as_str() {
                let reply = self.handle_command(text.trim()).await;
                if let Some(reply) = reply {
                    self.send_reply(&reply).await;
                }
            }
        }

        Ok(())
    }

    /// Map one command onto switch-file actions. Returns the reply text.
    pub async fn handle_command(&self, command: &str) -> Option<String> {
        match command {
            "/kill" => {
                self.kill.assert_on("telegram /kill");
                Some(
                    "🛑 KILL switch asserted.\nPending entries will be cancelled; \
                     positions keep their broker SLs."
                        .to_string(),
                )
            }
            "/pause" => {
                self.pause.assert_on("telegram /pause");
                Some("⏸ PAUSE switch asserted.\nOrder placement suspended; monitoring continues.".to_string())
            }
            "/resume" => {
                self.pause.clear();
                Some("▶️ PAUSE switch cleared.\nNormal order flow resumes.".to_string())
            }
            "/status" => {
                let status = self.status_text.read().await.clone();
                let mode = if self.kill.is_asserted() {
                    "KILLED"
                } else if self.pause.is_asserted() {
                    "PAUSED"
                } else {
                    "ACTIVE"
                };
                Some(format!("ℹ️ Mode: {}\n{}", mode, status))
            }
            "/menu" => Some(
                "Commands:\n\
                 /kill - stop trading, keep broker SLs\n\
                 /pause - suspend order placement\n\
                 /resume - clear pause\n\
                 /status - current engine status\n\
                 /menu - this list"
                    .to_string(),
            ),
            other => {
                debug!("[COMMANDS] Unknown command: {}", other);
                None
            }
        }
    }

    async fn get_updates(&self, offset: i64, timeout: u32) -> crate::error::Result<Vec<Value>> {
        let url = format!("https://api.telegram.org/bot{}/getUpdates", self.bot_token);
        let response = self
            .client
            .get(&url)
            .query(&[("offset", offset.to_string()), ("timeout", timeout.to_string())])
            .timeout(std::time::Duration::from_secs(timeout as u64 + 10))
            .send()
            .await?;

        let body: Value = response.json().await?;
        Ok(body["result"].as_array().cloned().unwrap_or_default())
    }

    async fn send_reply(&self, text: &str) {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let body = serde_json::json!({ "chat_id": self.chat_id, "text": text });
        if let Err(e) = self.client.post(&url).json(&body).send().await {
            error!("[COMMANDS] Reply failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener(dir: &std::path::Path) -> TelegramCommandListener {
        TelegramCommandListener::new(
            "token".to_string(),
            "12345".to_string(),
            Switch::kill(dir),
            Switch::pause(dir),
            Arc::new(RwLock::new("2 positions open".to_string())),
        )
    }

    fn temp_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("swingbreak_cmd_{}_{}", tag, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_kill_creates_file() {
        let dir = temp_dir("kill");
        let l = listener(&dir);

        let reply = l.handle_command("/kill").await.unwrap();
        assert!(reply.contains("KILL"));
        assert!(l.kill.is_asserted());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let dir = temp_dir("pause");
        let l = listener(&dir);

        l.handle_command("/pause").await;
        assert!(l.pause.is_asserted());

        l.handle_command("/resume").await;
        assert!(!l.pause.is_asserted());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_resume_without_pause_is_safe() {
        let dir = temp_dir("resume");
        let l = listener(&dir);

        let reply = l.handle_command("/resume").await;
        assert!(reply.is_some());
        assert!(!l.pause.is_asserted());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_status_reports_mode() {
        let dir = temp_dir("status");
        let l = listener(&dir);

        let reply = l.handle_command("/status").await.unwrap();
        assert!(reply.contains("ACTIVE"));
        assert!(reply.contains("2 positions open"));

        l.handle_command("/pause").await;
        let reply = l.handle_command("/status").await.unwrap();
        assert!(reply.contains("PAUSED"));

        l.handle_command("/kill").await;
        let reply = l.handle_command("/status").await.unwrap();
        assert!(reply.contains("KILLED"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_unknown_command_ignored() {
        let dir = temp_dir("unknown");
        let l = listener(&dir);
        assert!(l.handle_command("/explode").await.is_none());
        std::fs::remove_dir_all(&dir).ok();
    }
}
