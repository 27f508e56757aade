use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::config::ChannelDisableConfig;
use super::tasks::PeriodicTask;
use super::{Clock, SystemClock};

const DEFAULT_DISABLE_DURATION: Duration = Duration::from_secs(5 * 60);
const MAX_REASON_BYTES: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisabledChannelInfo {
    pub expire_at_ms: u64,
    pub reason: String,
}

impl DisabledChannelInfo {
    /// Expiry as an RFC3339 UTC timestamp, for log lines.
    pub fn expire_at_rfc3339(&self) -> String {
        let nanos = i128::from(self.expire_at_ms) * 1_000_000;
        OffsetDateTime::from_unix_timestamp_nanos(nanos)
            .ok()
            .and_then(|at| at.format(&Rfc3339).ok())
            .unwrap_or_else(|| self.expire_at_ms.to_string())
    }
}

type Entries = Arc<RwLock<HashMap<i64, DisabledChannelInfo>>>;

/// Time-windowed exclusion list for channels that misbehaved upstream.
///
/// Expired entries are dropped lazily when read and in bulk by a background
/// sweep, which starts on the first `disable` made inside a tokio runtime.
pub struct ChannelDisableRegistry {
    entries: Entries,
    clock: Arc<dyn Clock>,
    sweep_interval: Duration,
    sweeper_started: AtomicBool,
    sweeper: Mutex<Option<PeriodicTask>>,
}

impl std::fmt::Debug for ChannelDisableRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelDisableRegistry")
            .field("sweep_interval", &self.sweep_interval)
            .field("sweeper_started", &self.sweeper_started.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for ChannelDisableRegistry {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock), &ChannelDisableConfig::default())
    }
}

impl ChannelDisableRegistry {
    pub fn new(clock: Arc<dyn Clock>, config: &ChannelDisableConfig) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            clock,
            sweep_interval: Duration::from_secs(config.sweep_interval_secs.max(1)),
            sweeper_started: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        }
    }

    /// Marks `channel_id` unusable for `duration` (zero means five minutes)
    /// and returns the expiry in epoch milliseconds.
    pub fn disable(&self, channel_id: i64, duration: Duration, reason: &str) -> u64 {
        let duration = if duration.is_zero() {
            DEFAULT_DISABLE_DURATION
        } else {
            duration
        };
        let expire_at_ms = self
            .clock
            .now_epoch_millis()
            .saturating_add(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
        let reason = truncate_bytes(reason, MAX_REASON_BYTES).to_string();

        {
            let mut entries = self.entries.write().unwrap_or_else(|err| err.into_inner());
            entries.insert(
                channel_id,
                DisabledChannelInfo {
                    expire_at_ms,
                    reason,
                },
            );
        }
        tracing::info!(channel_id, expire_at_ms, "channel temporarily disabled");

        if tokio::runtime::Handle::try_current().is_ok() {
            self.start_sweeper();
        }
        expire_at_ms
    }

    pub fn is_disabled(&self, channel_id: i64) -> bool {
        self.info(channel_id).is_some()
    }

    pub fn info(&self, channel_id: i64) -> Option<DisabledChannelInfo> {
        let now = self.clock.now_epoch_millis();
        {
            let entries = self.entries.read().unwrap_or_else(|err| err.into_inner());
            match entries.get(&channel_id) {
                None => return None,
                Some(entry) if now < entry.expire_at_ms => return Some(entry.clone()),
                Some(_) => {}
            }
        }

        let mut entries = self.entries.write().unwrap_or_else(|err| err.into_inner());
        // Re-check: the channel may have been disabled again in between.
        match entries.get(&channel_id) {
            Some(entry) if now < entry.expire_at_ms => Some(entry.clone()),
            Some(_) => {
                entries.remove(&channel_id);
                None
            }
            None => None,
        }
    }

    pub fn enable(&self, channel_id: i64) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|err| err.into_inner());
        entries.remove(&channel_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every expired entry and returns how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        sweep(&self.entries, self.clock.now_epoch_millis())
    }

    /// Starts the background sweep. Only the first call has an effect.
    /// Must be called from within a tokio runtime.
    pub fn start_sweeper(&self) {
        if self
            .sweeper_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let entries = self.entries.clone();
        let clock = self.clock.clone();
        let task = PeriodicTask::spawn(
            "channel_disable_sweep",
            self.sweep_interval,
            false,
            move || {
                let removed = sweep(&entries, clock.now_epoch_millis());
                if removed > 0 {
                    tracing::debug!(removed, "swept expired channel disables");
                }
                std::future::ready(())
            },
        );
        *self.sweeper.lock().unwrap_or_else(|err| err.into_inner()) = Some(task);
    }

    pub async fn shutdown(&self) {
        let task = self
            .sweeper
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take();
        if let Some(task) = task {
            task.stop().await;
        }
    }
}

fn sweep(entries: &Entries, now_ms: u64) -> usize {
    let mut entries = entries.write().unwrap_or_else(|err| err.into_inner());
    let before = entries.len();
    entries.retain(|_, entry| now_ms < entry.expire_at_ms);
    before - entries.len()
}

fn truncate_bytes(value: &str, max_bytes: usize) -> &str {
    if value.len() <= max_bytes {
        return value;
    }
    let mut end = max_bytes;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

#[cfg(test)]
mod tests {
    use super::super::ManualClock;
    use super::*;

    fn registry(clock: Arc<ManualClock>) -> ChannelDisableRegistry {
        ChannelDisableRegistry::new(clock, &ChannelDisableConfig::default())
    }

    #[test]
    fn zero_duration_defaults_to_five_minutes() {
        let clock = Arc::new(ManualClock::new(1_000));
        let registry = registry(clock.clone());
        let expire_at = registry.disable(7, Duration::ZERO, "timeout");
        assert_eq!(expire_at, 1_000 + 300_000);
        assert!(registry.is_disabled(7));
        assert!(!registry.is_disabled(8));
    }

    #[test]
    fn huge_duration_saturates_instead_of_wrapping() {
        let clock = Arc::new(ManualClock::new(5_000));
        let registry = registry(clock.clone());
        assert_eq!(registry.disable(9, Duration::MAX, "manual"), u64::MAX);
        clock.advance_millis(86_400_000);
        assert!(registry.is_disabled(9));
    }

    #[test]
    fn expiry_is_rendered_as_rfc3339() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let registry = registry(clock);
        registry.disable(3, Duration::from_millis(1_500), "503");
        let info = registry.info(3).expect("disabled");
        assert_eq!(info.expire_at_rfc3339(), "2023-11-14T22:13:21.5Z");

        let far = DisabledChannelInfo {
            expire_at_ms: u64::MAX,
            reason: String::new(),
        };
        assert_eq!(far.expire_at_rfc3339(), u64::MAX.to_string());
    }

    #[test]
    fn expired_entry_is_removed_on_read() {
        let clock = Arc::new(ManualClock::new(0));
        let registry = registry(clock.clone());
        registry.disable(1, Duration::from_secs(10), "429");
        assert_eq!(registry.len(), 1);

        clock.advance_millis(9_999);
        assert!(registry.is_disabled(1));
        clock.advance_millis(1);
        assert!(registry.info(1).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn reason_is_capped_at_byte_limit_on_char_boundary() {
        let clock = Arc::new(ManualClock::new(0));
        let registry = registry(clock);
        let reason = "é".repeat(200);
        registry.disable(3, Duration::from_secs(1), &reason);
        let info = registry.info(3).expect("disabled");
        assert!(info.reason.len() <= MAX_REASON_BYTES);
        assert_eq!(info.reason.len(), 256);
    }

    #[test]
    fn sweep_drops_only_expired_entries() {
        let clock = Arc::new(ManualClock::new(0));
        let registry = registry(clock.clone());
        registry.disable(1, Duration::from_secs(1), "a");
        registry.disable(2, Duration::from_secs(100), "b");
        clock.advance_millis(5_000);
        assert_eq!(registry.sweep_expired(), 1);
        assert!(registry.is_disabled(2));
        assert!(registry.enable(2));
        assert!(!registry.is_disabled(2));
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweeper_starts_once_and_clears_entries() {
        let clock = Arc::new(ManualClock::new(0));
        let registry = registry(clock.clone());
        registry.disable(1, Duration::from_secs(1), "a");
        registry.disable(2, Duration::from_secs(1), "b");
        clock.advance_millis(2_000);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(registry.len(), 0);
        registry.shutdown().await;
    }
}
