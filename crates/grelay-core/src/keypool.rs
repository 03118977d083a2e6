//! Rotating pool of upstream Gemini API keys.
//!
//! Keys that hit quota or auth failures are parked for a cool-down window
//! and rejoin the rotation automatically once it elapses.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::warn;

const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct SelectedKey {
    pub id: String,
    pub secret: String,
}

#[derive(Debug)]
struct PoolEntry {
    id: String,
    secret: String,
    unavailable_until: Option<Instant>,
}

#[derive(Debug)]
pub struct KeyPool {
    entries: RwLock<Vec<PoolEntry>>,
    cursor: AtomicUsize,
    cooldown: Duration,
}

impl KeyPool {
    pub fn new(secrets: Vec<String>) -> Self {
        Self::with_cooldown(secrets, DEFAULT_COOLDOWN)
    }

    pub fn with_cooldown(secrets: Vec<String>, cooldown: Duration) -> Self {
        let entries = secrets
            .into_iter()
            .enumerate()
            .map(|(index, secret)| PoolEntry {
                id: format!("gk-{}", index + 1),
                secret,
                unavailable_until: None,
            })
            .collect();
        Self {
            entries: RwLock::new(entries),
            cursor: AtomicUsize::new(0),
            cooldown,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Next available key in round-robin order, or None when every key is
    /// cooling down.
    pub async fn acquire(&self) -> Option<SelectedKey> {
        let entries = self.entries.read().await;
        if entries.is_empty() {
            return None;
        }
        let now = Instant::now();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..entries.len() {
            let entry = &entries[(start + offset) % entries.len()];
            let available = entry
                .unavailable_until
                .map(|until| until <= now)
                .unwrap_or(true);
            if available {
                return Some(SelectedKey {
                    id: entry.id.clone(),
                    secret: entry.secret.clone(),
                });
            }
        }
        None
    }

    /// Park a key after an upstream quota or auth failure.
    pub async fn report_failure(&self, id: &str) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.iter_mut().find(|entry| entry.id == id) {
            entry.unavailable_until = Some(Instant::now() + self.cooldown);
            warn!(key_id = %id, cooldown_secs = self.cooldown.as_secs(), "key parked after upstream failure");
        }
    }

    pub async fn report_success(&self, id: &str) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.iter_mut().find(|entry| entry.id == id) {
            entry.unavailable_until = None;
        }
    }
}
