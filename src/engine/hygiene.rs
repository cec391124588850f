use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::protocol::envelope::now_ms;
use crate::transport::Sidechannel;

#[derive(Debug, Clone)]
pub struct HygieneConfig {
    pub hygiene_interval_ms: u64,
    pub swap_auto_leave_cooldown_ms: u64,
}

impl Default for HygieneConfig {
    fn default() -> Self {
        Self {
            hygiene_interval_ms: 30_000,
            swap_auto_leave_cooldown_ms: 60_000,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct TrackedChannel {
    /// The owning engine still drives this trade.
    active: bool,
    terminal: bool,
    invite_expires_at_ms: Option<u64>,
    last_leave_attempt_ms: u64,
}

/// Shared view of which `swap:*` channels the engines still care
/// about. The hygiene task reconciles transport membership against it.
#[derive(Debug, Default)]
pub struct ChannelTracker {
    inner: Mutex<HashMap<String, TrackedChannel>>,
}

impl ChannelTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Note an invite's expiry for a channel, keeping the latest seen.
    pub fn track_invite(&self, channel: &str, expires_at_ms: u64) {
        let mut inner = self.inner.lock().expect("tracker mutex poisoned");
        let entry = inner.entry(channel.to_string()).or_default();
        entry.invite_expires_at_ms = Some(
            entry
                .invite_expires_at_ms
                .map_or(expires_at_ms, |prev| prev.max(expires_at_ms)),
        );
    }

    pub fn mark_active(&self, channel: &str) {
        let mut inner = self.inner.lock().expect("tracker mutex poisoned");
        inner.entry(channel.to_string()).or_default().active = true;
    }

    pub fn mark_terminal(&self, channel: &str) {
        let mut inner = self.inner.lock().expect("tracker mutex poisoned");
        let entry = inner.entry(channel.to_string()).or_default();
        entry.terminal = true;
        entry.active = false;
    }

    pub fn forget(&self, channel: &str) {
        self.inner
            .lock()
            .expect("tracker mutex poisoned")
            .remove(channel);
    }

    fn should_leave(&self, channel: &str, now: u64, cooldown_ms: u64) -> bool {
        let mut inner = self.inner.lock().expect("tracker mutex poisoned");
        let entry = inner.entry(channel.to_string()).or_default();

        let stale = entry.terminal
            || !entry.active
            || entry
                .invite_expires_at_ms
                .is_some_and(|expires| now >= expires);
        if !stale {
            return false;
        }
        if now.saturating_sub(entry.last_leave_attempt_ms) < cooldown_ms {
            return false;
        }
        entry.last_leave_attempt_ms = now;
        true
    }

    /// Channels known only from invites, which the transport may not
    /// report as joined (e.g. the join was refused).
    fn tracked_channels(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("tracker mutex poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

/// Auto-leave controller: every interval, enumerate `swap:*` channels
/// and leave the ones no engine tracks anymore, trades in terminal
/// state, and channels whose latest invite expired. Leaves are
/// per-channel cooldown-limited to avoid join/leave thrash.
pub async fn run(
    cfg: HygieneConfig,
    transport: Arc<dyn Sidechannel>,
    tracker: Arc<ChannelTracker>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(cfg.hygiene_interval_ms));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = interval.tick() => {}
        }

        let mut channels: Vec<String> = match transport.stats().await {
            Ok(stats) => stats.into_iter().map(|s| s.channel).collect(),
            Err(err) => {
                tracing::debug!(error = %err, "hygiene stats failed");
                Vec::new()
            }
        };
        channels.extend(tracker.tracked_channels());
        channels.sort();
        channels.dedup();

        let now = now_ms();
        for channel in channels {
            if !channel.starts_with("swap:") {
                continue;
            }
            if !tracker.should_leave(&channel, now, cfg.swap_auto_leave_cooldown_ms) {
                continue;
            }
            tracing::info!(%channel, "hygiene: leaving stale swap channel");
            match transport.leave(&channel).await {
                Ok(()) => tracker.forget(&channel),
                Err(err) => tracing::debug!(%channel, error = %err, "hygiene leave failed"),
            }
        }
    }
}
