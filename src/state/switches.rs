/// File-based control switches
///
/// Sentinel files are intentional: they must be writable from unrelated
/// processes (dashboard, operator SSH) without any IPC dependency. The DB
/// control flags mirror them.
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One sentinel file (KILL_SWITCH or PAUSE_SWITCH)
#[derive(Debug, Clone)]
pub struct Switch {
    path: PathBuf,
    name: &'static str,
}

impl Switch {
    pub fn kill(dir: &Path) -> Self {
        Switch {
            path: dir.join("KILL_SWITCH"),
            name: "KILL_SWITCH",
        }
    }

    pub fn pause(dir: &Path) -> Self {
        Switch {
            path: dir.join("PAUSE_SWITCH"),
            name: "PAUSE_SWITCH",
        }
    }

    pub fn is_asserted(&self) -> bool {
        self.path.exists()
    }

    pub fn assert_on(&self, reason: &str) {
        if let Err(e) = std::fs::write(&self.path, reason) {
            warn!("Failed to create {}: {}", self.name, e);
        } else {
            info!("{} asserted: {}", self.name, reason);
        }
    }

    pub fn clear(&self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("Failed to remove {}: {}", self.name, e);
            } else {
                info!("{} cleared", self.name);
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switch_lifecycle() {
        let dir = std::env::temp_dir().join(format!("swingbreak_sw_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let kill = Switch::kill(&dir);
        assert!(!kill.is_asserted());

        kill.assert_on("operator /kill");
        assert!(kill.is_asserted());

        kill.clear();
        assert!(!kill.is_asserted());

        // Clearing an absent switch is safe
        kill.clear();

        std::fs::remove_dir_all(&dir).ok();
    }
}
