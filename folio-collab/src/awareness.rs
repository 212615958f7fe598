//! Awareness: who is in the room and where their cursor is.
//!
//! ```text
//! Local selection change
//!       │
//!       ▼
//! AwarenessStore::set_local_cursor()
//!       │  (throttled; the latest value is kept as pending)
//!       ▼
//! AwarenessEntry { client_id, clock, state }
//!       │
//!       ▼   (awareness-update, relayed to the room)
//! Remote AwarenessStore::apply_remote()
//!       │  (older clocks ignored, None = left)
//!       ▼
//! EditorAdapter::remote_cursors()
//! ```
//!
//! Awareness is ephemeral. It is never merged into the document replica and
//! nothing here is persisted.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::AwarenessConfig;
use crate::protocol::AwarenessEntry;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// A text selection; `anchor == head` is a collapsed caret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRange {
    pub anchor: u32,
    pub head: u32,
}

impl CursorRange {
    pub fn caret(position: u32) -> Self {
        Self {
            anchor: position,
            head: position,
        }
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.head
    }
}

/// What one client publishes about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessState {
    pub user_name: String,
    /// `#rrggbb`
    pub color: String,
    pub cursor: Option<CursorRange>,
}

/// Stable, visually distinct color for a client id.
pub fn color_for(id: Uuid) -> String {
    let hue = ((id.as_u128() % 360) as f32) / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!("#{:02x}{:02x}{:02x}", channel(r), channel(g), channel(b))
}

fn channel(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l); // Achromatic
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Remote entries
// ───────────────────────────────────────────────────────────────────

/// Latest known state of one remote client.
#[derive(Debug, Clone)]
pub struct RemotePresence {
    pub client_id: Uuid,
    pub clock: u64,
    pub state: AwarenessState,
    last_seen: Instant,
}

impl RemotePresence {
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

// ───────────────────────────────────────────────────────────────────
// Store
// ───────────────────────────────────────────────────────────────────

/// Per-room awareness set: the local client's state plus every remote
/// client's latest state, keyed by ephemeral client id.
pub struct AwarenessStore {
    local_id: Uuid,
    local: AwarenessState,
    /// Monotonic clock stamped on every outgoing entry.
    local_clock: u64,
    remote: HashMap<Uuid, RemotePresence>,
    /// Highest clock seen per remote client and when it arrived. Kept after
    /// removal so a late stale update cannot resurrect a client that left,
    /// then pruned by [`remove_idle`](Self::remove_idle).
    clocks: HashMap<Uuid, (u64, Instant)>,
    last_cursor_broadcast: Option<Instant>,
    pending_cursor: bool,
    config: AwarenessConfig,
}

impl AwarenessStore {
    /// Store for a fresh client id.
    pub fn new(user_name: impl Into<String>, config: AwarenessConfig) -> Self {
        Self::with_client_id(Uuid::new_v4(), user_name, config)
    }

    pub fn with_client_id(local_id: Uuid, user_name: impl Into<String>, config: AwarenessConfig) -> Self {
        Self {
            local_id,
            local: AwarenessState {
                user_name: user_name.into(),
                color: color_for(local_id),
                cursor: None,
            },
            local_clock: 0,
            remote: HashMap::new(),
            clocks: HashMap::new(),
            last_cursor_broadcast: None,
            pending_cursor: false,
            config,
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.local_id
    }

    /// Clock of the most recent outgoing entry.
    pub fn local_clock(&self) -> u64 {
        self.local_clock
    }

    pub fn local_state(&self) -> &AwarenessState {
        &self.local
    }

    /// Change the displayed user name. Always broadcast.
    pub fn set_local_user(&mut self, user_name: impl Into<String>) -> AwarenessEntry {
        self.local.user_name = user_name.into();
        self.local_update()
    }

    /// Record the local selection.
    ///
    /// Returns an entry to broadcast only if the throttle interval has
    /// elapsed since the previous cursor broadcast; otherwise the value is
    /// kept as pending for [`take_pending`](Self::take_pending).
    pub fn set_local_cursor(&mut self, cursor: Option<CursorRange>) -> Option<AwarenessEntry> {
        self.local.cursor = cursor;

        let throttled = self
            .last_cursor_broadcast
            .is_some_and(|at| at.elapsed() < self.config.cursor_interval);
        if throttled {
            self.pending_cursor = true;
            return None;
        }

        Some(self.local_update())
    }

    /// Trailing update for a throttled cursor change, if one is pending.
    pub fn take_pending(&mut self) -> Option<AwarenessEntry> {
        if !self.pending_cursor {
            return None;
        }
        Some(self.local_update())
    }

    /// Time left before the throttle admits another cursor broadcast.
    pub fn throttle_remaining(&self) -> Duration {
        self.last_cursor_broadcast
            .map_or(Duration::ZERO, |at| self.config.cursor_interval.saturating_sub(at.elapsed()))
    }

    /// Whether a throttled cursor change is waiting to be sent.
    pub fn has_pending(&self) -> bool {
        self.pending_cursor
    }

    /// Entry carrying the full local state, bypassing the throttle.
    pub fn local_update(&mut self) -> AwarenessEntry {
        self.local_clock += 1;
        self.last_cursor_broadcast = Some(Instant::now());
        self.pending_cursor = false;
        AwarenessEntry {
            client_id: self.local_id,
            clock: self.local_clock,
            state: Some(self.local.clone()),
        }
    }

    /// Periodic re-send of the full local state.
    ///
    /// Unlike [`local_update`](Self::local_update) this leaves the cursor
    /// throttle alone, so a renewal never delays the next selection change.
    pub fn renew(&mut self) -> AwarenessEntry {
        self.local_clock += 1;
        self.pending_cursor = false;
        AwarenessEntry {
            client_id: self.local_id,
            clock: self.local_clock,
            state: Some(self.local.clone()),
        }
    }

    /// Entry announcing that the local client left.
    pub fn leave_update(&mut self) -> AwarenessEntry {
        self.local_clock += 1;
        self.pending_cursor = false;
        AwarenessEntry {
            client_id: self.local_id,
            clock: self.local_clock,
            state: None,
        }
    }

    /// Merge entries received from the network.
    ///
    /// Last write wins per client id; entries older than the newest clock
    /// already seen for that client are ignored, and the local client's own
    /// entry is never overwritten. Returns the ids whose state changed.
    pub fn apply_remote(&mut self, entries: &[AwarenessEntry]) -> Vec<Uuid> {
        let mut changed = Vec::new();

        for entry in entries {
            if entry.client_id == self.local_id {
                continue;
            }
            if let Some(&(seen, _)) = self.clocks.get(&entry.client_id) {
                if entry.clock < seen {
                    log::trace!("Ignoring stale awareness clock {} for {}", entry.clock, entry.client_id);
                    continue;
                }
            }
            self.clocks.insert(entry.client_id, (entry.clock, Instant::now()));

            match &entry.state {
                Some(state) => {
                    let previous = self.remote.insert(
                        entry.client_id,
                        RemotePresence {
                            client_id: entry.client_id,
                            clock: entry.clock,
                            state: state.clone(),
                            last_seen: Instant::now(),
                        },
                    );
                    if previous.is_none_or(|p| p.state != *state) {
                        changed.push(entry.client_id);
                    }
                }
                None => {
                    if self.remote.remove(&entry.client_id).is_some() {
                        changed.push(entry.client_id);
                    }
                }
            }
        }

        changed
    }

    /// Drop remote clients that have been silent past the idle timeout.
    ///
    /// Clocks of clients that are already gone are forgotten once they are
    /// as old as the timeout. Returns the clients removed from the set.
    pub fn remove_idle(&mut self) -> Vec<Uuid> {
        let timeout = self.config.idle_timeout;
        let stale: Vec<Uuid> = self
            .remote
            .iter()
            .filter(|(_, p)| p.is_idle(timeout))
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            self.remote.remove(id);
        }

        let remote = &self.remote;
        self.clocks
            .retain(|id, (_, seen)| remote.contains_key(id) || seen.elapsed() <= timeout);

        stale
    }

    /// Forget every remote client (e.g. after leaving the room).
    pub fn clear_remote(&mut self) {
        self.remote.clear();
        self.clocks.clear();
    }

    pub fn get(&self, client_id: &Uuid) -> Option<&RemotePresence> {
        self.remote.get(client_id)
    }

    /// Remote clients ordered by client id, for stable rendering.
    pub fn remote_states(&self) -> Vec<&RemotePresence> {
        let mut states: Vec<&RemotePresence> = self.remote.values().collect();
        states.sort_by_key(|p| p.client_id);
        states
    }

    pub fn remote_count(&self) -> usize {
        self.remote.len()
    }

    /// Remote clients whose clock is still remembered, present or not.
    pub fn tracked_clients(&self) -> usize {
        self.clocks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn config(interval_ms: u64) -> AwarenessConfig {
        AwarenessConfig {
            cursor_interval: Duration::from_millis(interval_ms),
            ..AwarenessConfig::default()
        }
    }

    fn remote_entry(id: Uuid, clock: u64, name: &str, cursor: Option<CursorRange>) -> AwarenessEntry {
        AwarenessEntry {
            client_id: id,
            clock,
            state: Some(AwarenessState {
                user_name: name.into(),
                color: color_for(id),
                cursor,
            }),
        }
    }

    // ── Colors ───────────────────────────────────────────────────

    #[test]
    fn test_color_is_stable_hex() {
        let id = Uuid::new_v4();
        let color = color_for(id);
        assert_eq!(color, color_for(id));
        assert_eq!(color.len(), 7);
        assert!(color.starts_with('#'));
        assert!(color[1..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hsl_to_rgb_red() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((r - 1.0).abs() < 0.01);
        assert!(g.abs() < 0.01);
        assert!(b.abs() < 0.01);
    }

    #[test]
    fn test_hsl_to_rgb_achromatic() {
        assert_eq!(hsl_to_rgb(0.3, 0.0, 0.5), (0.5, 0.5, 0.5));
    }

    // ── Local side ───────────────────────────────────────────────

    #[test]
    fn test_first_cursor_broadcasts_immediately() {
        let mut store = AwarenessStore::new("Ana", config(1000));
        let entry = store.set_local_cursor(Some(CursorRange::caret(3))).unwrap();
        assert_eq!(entry.client_id, store.client_id());
        assert_eq!(entry.clock, 1);
        assert_eq!(entry.state.unwrap().cursor, Some(CursorRange::caret(3)));
    }

    #[test]
    fn test_cursor_throttled_then_pending_flushed() {
        let mut store = AwarenessStore::new("Ana", config(1000));
        assert!(store.set_local_cursor(Some(CursorRange::caret(1))).is_some());
        assert!(store.set_local_cursor(Some(CursorRange::caret(2))).is_none());
        assert!(store.set_local_cursor(Some(CursorRange { anchor: 2, head: 6 })).is_none());
        assert!(store.has_pending());

        let trailing = store.take_pending().unwrap();
        assert_eq!(
            trailing.state.unwrap().cursor,
            Some(CursorRange { anchor: 2, head: 6 })
        );
        assert!(!store.has_pending());
        assert!(store.take_pending().is_none());
    }

    #[test]
    fn test_cursor_after_interval() {
        let mut store = AwarenessStore::new("Ana", config(5));
        let _ = store.set_local_cursor(Some(CursorRange::caret(1)));
        thread::sleep(Duration::from_millis(10));
        assert!(store.set_local_cursor(Some(CursorRange::caret(2))).is_some());
    }

    #[test]
    fn test_local_clock_increments() {
        let mut store = AwarenessStore::new("Ana", config(0));
        let a = store.local_update();
        let b = store.set_local_user("Ana B.");
        let c = store.leave_update();
        assert!(a.clock < b.clock && b.clock < c.clock);
        assert!(c.state.is_none());
        assert_eq!(store.local_state().user_name, "Ana B.");
    }

    // ── Remote side ──────────────────────────────────────────────

    #[test]
    fn test_apply_remote_last_write_wins() {
        let mut store = AwarenessStore::new("local", config(0));
        let peer = Uuid::new_v4();

        let changed = store.apply_remote(&[remote_entry(peer, 1, "Bo", Some(CursorRange::caret(1)))]);
        assert_eq!(changed, vec![peer]);
        store.apply_remote(&[remote_entry(peer, 2, "Bo", Some(CursorRange::caret(9)))]);

        assert_eq!(store.get(&peer).unwrap().state.cursor, Some(CursorRange::caret(9)));
        assert_eq!(store.remote_count(), 1);
    }

    #[test]
    fn test_apply_remote_rejects_stale_clock() {
        let mut store = AwarenessStore::new("local", config(0));
        let peer = Uuid::new_v4();

        store.apply_remote(&[remote_entry(peer, 5, "Bo", Some(CursorRange::caret(5)))]);
        let changed = store.apply_remote(&[remote_entry(peer, 4, "Bo", Some(CursorRange::caret(4)))]);

        assert!(changed.is_empty());
        assert_eq!(store.get(&peer).unwrap().clock, 5);
    }

    #[test]
    fn test_apply_remote_same_state_reports_no_change() {
        let mut store = AwarenessStore::new("local", config(0));
        let peer = Uuid::new_v4();
        store.apply_remote(&[remote_entry(peer, 1, "Bo", None)]);
        assert!(store.apply_remote(&[remote_entry(peer, 2, "Bo", None)]).is_empty());
    }

    #[test]
    fn test_apply_remote_ignores_self() {
        let mut store = AwarenessStore::new("local", config(0));
        let own = store.client_id();
        assert!(store.apply_remote(&[remote_entry(own, 99, "evil", None)]).is_empty());
        assert_eq!(store.remote_count(), 0);
        assert_eq!(store.local_state().user_name, "local");
    }

    #[test]
    fn test_leave_removes_and_blocks_resurrection() {
        let mut store = AwarenessStore::new("local", config(0));
        let peer = Uuid::new_v4();

        store.apply_remote(&[remote_entry(peer, 3, "Bo", None)]);
        let changed = store.apply_remote(&[AwarenessEntry { client_id: peer, clock: 4, state: None }]);
        assert_eq!(changed, vec![peer]);
        assert!(store.get(&peer).is_none());

        // A delayed update from before the leave must not bring the peer back.
        store.apply_remote(&[remote_entry(peer, 3, "Bo", None)]);
        assert!(store.get(&peer).is_none());
    }

    #[test]
    fn test_remove_idle() {
        let mut store = AwarenessStore::new(
            "local",
            AwarenessConfig {
                cursor_interval: Duration::ZERO,
                idle_timeout: Duration::from_millis(5),
                renew_interval: Duration::from_millis(2),
            },
        );
        let peer = Uuid::new_v4();
        store.apply_remote(&[remote_entry(peer, 1, "Bo", None)]);

        thread::sleep(Duration::from_millis(15));
        assert_eq!(store.remove_idle(), vec![peer]);
        assert_eq!(store.remote_count(), 0);
    }

    #[test]
    fn test_clocks_of_departed_clients_are_pruned() {
        let mut store = AwarenessStore::new(
            "local",
            AwarenessConfig {
                cursor_interval: Duration::ZERO,
                idle_timeout: Duration::from_millis(20),
                renew_interval: Duration::from_millis(10),
            },
        );
        let present = Uuid::new_v4();
        for _ in 0..50 {
            let peer = Uuid::new_v4();
            store.apply_remote(&[remote_entry(peer, 1, "Bo", None)]);
            store.apply_remote(&[AwarenessEntry { client_id: peer, clock: 2, state: None }]);
        }
        assert_eq!(store.tracked_clients(), 50);

        // Freshly departed clients keep their clock for a while.
        assert!(store.remove_idle().is_empty());
        assert_eq!(store.tracked_clients(), 50);

        thread::sleep(Duration::from_millis(40));
        store.apply_remote(&[remote_entry(present, 1, "Cy", None)]);
        assert!(store.remove_idle().is_empty());
        assert_eq!(store.tracked_clients(), 1);
        assert!(store.get(&present).is_some());
    }

    #[test]
    fn test_renew_keeps_cursor_throttle() {
        let mut store = AwarenessStore::new("Ana", config(1000));
        let first = store.set_local_cursor(Some(CursorRange::caret(1))).unwrap();
        let renewed = store.renew();
        assert!(renewed.clock > first.clock);
        assert_eq!(renewed.state.unwrap().cursor, Some(CursorRange::caret(1)));
        // Still inside the interval opened by the first broadcast.
        assert!(store.set_local_cursor(Some(CursorRange::caret(2))).is_none());

        let mut fresh = AwarenessStore::new("Bo", config(1000));
        let _ = fresh.renew();
        assert!(fresh.set_local_cursor(Some(CursorRange::caret(2))).is_some());
    }

    #[test]
    fn test_remote_states_sorted() {
        let mut store = AwarenessStore::new("local", config(0));
        let entries: Vec<_> = (0..4)
            .map(|i| remote_entry(Uuid::new_v4(), 1, &format!("peer{i}"), None))
            .collect();
        store.apply_remote(&entries);

        let ids: Vec<Uuid> = store.remote_states().iter().map(|p| p.client_id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }
}
