//! The fleet store: slot table, session records, and the two-token access
//! scheme, all guarded by one mutex so claim/release/heartbeat transitions
//! never interleave per slot.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use passage_core::token::{mint_token, TokenPair};

use crate::config::{Config, SlotConfig};

pub const URL_TOKEN_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("all browsers are in use ({in_use}/{total})")]
    AllSlotsBusy { in_use: usize, total: usize },
    #[error("unknown slot {0}")]
    UnknownSlot(usize),
    #[error("no session matches the given identifier")]
    NoSession,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: Uuid,
    pub client_id: String,
    pub cookie_token: String,
    pub assigned_at: Instant,
    pub last_heartbeat: Instant,
    pub assigned_at_unix: u64,
    pub last_heartbeat_unix: u64,
    heartbeat_seq: u64,
}

#[derive(Debug)]
struct Slot {
    upstream: SlotConfig,
    session: Option<Session>,
    active_ws: usize,
    last_disconnect: Option<Instant>,
}

#[derive(Debug, Clone)]
struct UrlTokenGrant {
    slot_id: usize,
    cookie_token: String,
    minted_at: Instant,
}

/// What one `request`/`check` hands back to the API layer.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub slot_id: usize,
    pub session_id: Uuid,
    pub url_token: String,
    pub existing: bool,
    pub session_age: Duration,
}

/// Mirror-facing view of one slot, produced under the store lock.
#[derive(Debug, Clone)]
pub struct SlotSnapshot {
    pub slot_id: usize,
    pub in_use: bool,
    pub client_id: Option<String>,
    pub session_id: Option<String>,
    pub last_used: u64,
    pub last_heartbeat: u64,
}

#[derive(Debug, Clone)]
pub struct FleetStatus {
    pub total: usize,
    pub available: usize,
    pub in_use: usize,
    pub browsers: Vec<(usize, bool)>,
}

struct FleetInner {
    /// Slot table indexed by `slot_id - 1`; slot ids are stable 1..=N.
    slots: Vec<Slot>,
    by_client: HashMap<String, usize>,
    by_cookie: HashMap<String, usize>,
    url_tokens: HashMap<String, UrlTokenGrant>,
}

pub struct FleetStore {
    inner: Mutex<FleetInner>,
    session_timeout: Duration,
    ws_presence_timeout: Duration,
    assignment_grace: Duration,
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl FleetStore {
    pub fn new(config: &Config) -> Self {
        let slots = config
            .slots
            .iter()
            .map(|upstream| Slot {
                upstream: upstream.clone(),
                session: None,
                active_ws: 0,
                last_disconnect: None,
            })
            .collect();
        Self {
            inner: Mutex::new(FleetInner {
                slots,
                by_client: HashMap::new(),
                by_cookie: HashMap::new(),
                url_tokens: HashMap::new(),
            }),
            session_timeout: config.session_timeout,
            ws_presence_timeout: config.ws_presence_timeout,
            assignment_grace: config.assignment_grace,
        }
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    /// Claim a slot for `client_id`, or rotate a fresh one-shot URL token for
    /// its existing session. Find-free-and-claim happens under one lock hold,
    /// so two concurrent requests for the same client observe one assignment.
    pub fn request(&self, client_id: &str, now: Instant) -> Result<Assignment, FleetError> {
        let mut inner = self.inner.lock().expect("fleet lock poisoned");

        if let Some(&slot_id) = inner.by_client.get(client_id) {
            if let Some(assignment) = inner.mint_url_token(slot_id, now) {
                return Ok(assignment);
            }
        }

        let free = inner
            .slots
            .iter()
            .position(|slot| slot.session.is_none());
        let Some(index) = free else {
            let total = inner.slots.len();
            let in_use = total - inner.free_count();
            return Err(FleetError::AllSlotsBusy { in_use, total });
        };
        let slot_id = index + 1;

        let tokens = TokenPair::mint();
        let session = Session {
            session_id: Uuid::new_v4(),
            client_id: client_id.to_string(),
            cookie_token: tokens.cookie_token.clone(),
            assigned_at: now,
            last_heartbeat: now,
            assigned_at_unix: unix_now(),
            last_heartbeat_unix: unix_now(),
            heartbeat_seq: 0,
        };
        let session_id = session.session_id;
        inner.slots[index].session = Some(session);
        inner.slots[index].active_ws = 0;
        inner.slots[index].last_disconnect = None;
        inner.by_client.insert(client_id.to_string(), slot_id);
        inner.by_cookie.insert(tokens.cookie_token.clone(), slot_id);
        inner.url_tokens.insert(
            tokens.url_token.clone(),
            UrlTokenGrant {
                slot_id,
                cookie_token: tokens.cookie_token,
                minted_at: now,
            },
        );

        info!(slot = slot_id, client = %client_id, session = %session_id, "slot assigned");
        Ok(Assignment {
            slot_id,
            session_id,
            url_token: tokens.url_token,
            existing: false,
            session_age: Duration::ZERO,
        })
    }

    /// Look up the live session for `client_id`, rotating a fresh URL token.
    pub fn check(&self, client_id: &str, now: Instant) -> Option<Assignment> {
        let mut inner = self.inner.lock().expect("fleet lock poisoned");
        let slot_id = *inner.by_client.get(client_id)?;
        inner.mint_url_token(slot_id, now)
    }

    /// Record a heartbeat by slot id or session id. Returns true when this
    /// beat should propagate to the state mirror (1-in-5 sampling).
    pub fn heartbeat_slot(&self, slot_id: usize, now: Instant) -> Result<bool, FleetError> {
        let mut inner = self.inner.lock().expect("fleet lock poisoned");
        let slot = inner
            .slots
            .get_mut(slot_id.wrapping_sub(1))
            .ok_or(FleetError::UnknownSlot(slot_id))?;
        let session = slot.session.as_mut().ok_or(FleetError::NoSession)?;
        Ok(beat(session, now))
    }

    /// Heartbeat by session id. Returns the slot id alongside the mirror
    /// sampling decision.
    pub fn heartbeat_session(
        &self,
        session_id: Uuid,
        now: Instant,
    ) -> Result<(usize, bool), FleetError> {
        let mut inner = self.inner.lock().expect("fleet lock poisoned");
        for (index, slot) in inner.slots.iter_mut().enumerate() {
            if let Some(session) = slot.session.as_mut() {
                if session.session_id == session_id {
                    return Ok((index + 1, beat(session, now)));
                }
            }
        }
        Err(FleetError::NoSession)
    }

    /// True when `cookie_token` grants access to `slot_id`.
    pub fn grant_for_cookie(&self, cookie_token: &str, slot_id: usize) -> bool {
        let inner = self.inner.lock().expect("fleet lock poisoned");
        inner.by_cookie.get(cookie_token) == Some(&slot_id)
    }

    /// Atomically consume a one-shot URL token for `slot_id`. Success hands
    /// back the partner cookie token exactly once.
    pub fn consume_url_token(&self, token: &str, slot_id: usize, now: Instant) -> Option<String> {
        let mut inner = self.inner.lock().expect("fleet lock poisoned");
        let grant = inner.url_tokens.get(token)?.clone();
        if grant.slot_id != slot_id || now.duration_since(grant.minted_at) > URL_TOKEN_TTL {
            return None;
        }
        inner.url_tokens.remove(token);
        Some(grant.cookie_token)
    }

    pub fn release_client(&self, client_id: &str) -> Option<SlotSnapshot> {
        let slot_id = {
            let inner = self.inner.lock().expect("fleet lock poisoned");
            inner.by_client.get(client_id).copied()
        }?;
        self.release_slot(slot_id)
    }

    /// Tear down a slot's session: record, both token maps (including every
    /// outstanding URL token for the slot), the client mapping, and liveness
    /// fields, all under one lock hold. Returns the tombstone snapshot.
    pub fn release_slot(&self, slot_id: usize) -> Option<SlotSnapshot> {
        let mut inner = self.inner.lock().expect("fleet lock poisoned");
        let slot = inner.slots.get_mut(slot_id.wrapping_sub(1))?;
        let session = slot.session.take()?;
        slot.active_ws = 0;
        slot.last_disconnect = None;
        inner.by_client.remove(&session.client_id);
        inner.by_cookie.remove(&session.cookie_token);
        inner.url_tokens.retain(|_, grant| grant.slot_id != slot_id);
        info!(slot = slot_id, session = %session.session_id, "slot released");
        Some(SlotSnapshot {
            slot_id,
            in_use: false,
            client_id: None,
            session_id: None,
            last_used: unix_now(),
            last_heartbeat: 0,
        })
    }

    pub fn ws_connected(&self, slot_id: usize) {
        let mut inner = self.inner.lock().expect("fleet lock poisoned");
        if let Some(slot) = inner.slots.get_mut(slot_id.wrapping_sub(1)) {
            slot.active_ws += 1;
            slot.last_disconnect = None;
        }
    }

    pub fn ws_disconnected(&self, slot_id: usize, now: Instant) {
        let mut inner = self.inner.lock().expect("fleet lock poisoned");
        if let Some(slot) = inner.slots.get_mut(slot_id.wrapping_sub(1)) {
            slot.active_ws = slot.active_ws.saturating_sub(1);
            if slot.active_ws == 0 {
                slot.last_disconnect = Some(now);
            }
        }
    }

    /// One reaper pass: sessions past the heartbeat timeout, and sessions
    /// with no WebSocket presence past the presence timeout (with a grace
    /// window after assignment for slow first connects).
    pub fn reap(&self, now: Instant) -> Vec<SlotSnapshot> {
        let stale: Vec<usize> = {
            let inner = self.inner.lock().expect("fleet lock poisoned");
            inner
                .slots
                .iter()
                .enumerate()
                .filter_map(|(index, slot)| {
                    let session = slot.session.as_ref()?;
                    let slot_id = index + 1;
                    if now.duration_since(session.last_heartbeat) > self.session_timeout {
                        info!(slot = slot_id, "reaping: heartbeat timeout");
                        return Some(slot_id);
                    }
                    if slot.active_ws == 0
                        && now.duration_since(session.assigned_at) > self.assignment_grace
                    {
                        let idle_since = slot.last_disconnect.unwrap_or(session.assigned_at);
                        if now.duration_since(idle_since) > self.ws_presence_timeout {
                            info!(slot = slot_id, "reaping: no websocket presence");
                            return Some(slot_id);
                        }
                    }
                    None
                })
                .collect()
        };
        stale
            .into_iter()
            .filter_map(|slot_id| self.release_slot(slot_id))
            .collect()
    }

    /// Drop URL tokens older than their TTL. Returns how many were removed.
    pub fn gc_url_tokens(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock().expect("fleet lock poisoned");
        let before = inner.url_tokens.len();
        inner
            .url_tokens
            .retain(|_, grant| now.duration_since(grant.minted_at) <= URL_TOKEN_TTL);
        before - inner.url_tokens.len()
    }

    /// Restore one slot from mirrored state after a restart. The cookie
    /// token is re-minted: the old reverse maps did not persist, so tokens
    /// from before the restart can never be accepted again.
    pub fn restore(
        &self,
        slot_id: usize,
        client_id: String,
        session_id: Option<Uuid>,
        last_heartbeat_unix: u64,
        now: Instant,
    ) -> bool {
        let mut inner = self.inner.lock().expect("fleet lock poisoned");
        let Some(slot) = inner.slots.get_mut(slot_id.wrapping_sub(1)) else {
            return false;
        };
        if slot.session.is_some() {
            return false;
        }
        let cookie_token = mint_token();
        slot.session = Some(Session {
            session_id: session_id.unwrap_or_else(Uuid::new_v4),
            client_id: client_id.clone(),
            cookie_token: cookie_token.clone(),
            assigned_at: now,
            last_heartbeat: now,
            assigned_at_unix: unix_now(),
            last_heartbeat_unix,
            heartbeat_seq: 0,
        });
        inner.by_client.insert(client_id, slot_id);
        inner.by_cookie.insert(cookie_token, slot_id);
        true
    }

    pub fn status(&self) -> FleetStatus {
        let inner = self.inner.lock().expect("fleet lock poisoned");
        let total = inner.slots.len();
        let browsers: Vec<(usize, bool)> = inner
            .slots
            .iter()
            .enumerate()
            .map(|(index, slot)| (index + 1, slot.session.is_none()))
            .collect();
        let available = browsers.iter().filter(|(_, free)| *free).count();
        FleetStatus {
            total,
            available,
            in_use: total - available,
            browsers,
        }
    }

    pub fn slot_snapshot(&self, slot_id: usize) -> Option<SlotSnapshot> {
        let inner = self.inner.lock().expect("fleet lock poisoned");
        let slot = inner.slots.get(slot_id.wrapping_sub(1))?;
        Some(match &slot.session {
            Some(session) => SlotSnapshot {
                slot_id,
                in_use: true,
                client_id: Some(session.client_id.clone()),
                session_id: Some(session.session_id.to_string()),
                last_used: session.assigned_at_unix,
                last_heartbeat: session.last_heartbeat_unix,
            },
            None => SlotSnapshot {
                slot_id,
                in_use: false,
                client_id: None,
                session_id: None,
                last_used: 0,
                last_heartbeat: 0,
            },
        })
    }

    pub fn upstream_of(&self, slot_id: usize) -> Option<SlotConfig> {
        let inner = self.inner.lock().expect("fleet lock poisoned");
        inner
            .slots
            .get(slot_id.wrapping_sub(1))
            .map(|slot| slot.upstream.clone())
    }

    pub fn total_slots(&self) -> usize {
        self.inner.lock().expect("fleet lock poisoned").slots.len()
    }
}

impl FleetInner {
    fn free_count(&self) -> usize {
        self.slots.iter().filter(|s| s.session.is_none()).count()
    }

    /// Rotate a fresh one-shot URL token for a live session, keeping the
    /// long-lived cookie token in place.
    fn mint_url_token(&mut self, slot_id: usize, now: Instant) -> Option<Assignment> {
        let slot = self.slots.get(slot_id.wrapping_sub(1))?;
        let session = slot.session.as_ref()?;
        let url_token = mint_token();
        let grant = UrlTokenGrant {
            slot_id,
            cookie_token: session.cookie_token.clone(),
            minted_at: now,
        };
        let assignment = Assignment {
            slot_id,
            session_id: session.session_id,
            url_token: url_token.clone(),
            existing: true,
            session_age: now.duration_since(session.assigned_at),
        };
        self.url_tokens.insert(url_token, grant);
        Some(assignment)
    }
}

fn beat(session: &mut Session, now: Instant) -> bool {
    session.last_heartbeat = now;
    session.last_heartbeat_unix = unix_now();
    session.heartbeat_seq += 1;
    session.heartbeat_seq % 5 == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Cli;
    use clap::Parser;

    fn store_with_slots(n: usize) -> FleetStore {
        let slots = (0..n)
            .map(|i| format!("10.0.0.{}:6901", i + 1))
            .collect::<Vec<_>>()
            .join(",");
        let cli = Cli::parse_from(["passage-fleet", "--slots", &slots]);
        FleetStore::new(&Config::try_from(cli).unwrap())
    }

    #[test]
    fn lowest_free_slot_is_claimed_first() {
        let store = store_with_slots(3);
        let now = Instant::now();
        let a = store.request("c1", now).unwrap();
        let b = store.request("c2", now).unwrap();
        assert_eq!(a.slot_id, 1);
        assert_eq!(b.slot_id, 2);

        store.release_slot(1).unwrap();
        let c = store.request("c3", now).unwrap();
        assert_eq!(c.slot_id, 1);
    }

    #[test]
    fn one_slot_per_client() {
        let store = store_with_slots(3);
        let now = Instant::now();
        let first = store.request("c1", now).unwrap();
        let second = store.request("c1", now).unwrap();
        assert_eq!(first.slot_id, second.slot_id);
        assert_eq!(first.session_id, second.session_id);
        assert!(second.existing);
        assert_ne!(first.url_token, second.url_token, "url token rotates per request");
    }

    #[test]
    fn full_fleet_reports_busy() {
        let store = store_with_slots(1);
        let now = Instant::now();
        store.request("c1", now).unwrap();
        match store.request("c2", now) {
            Err(FleetError::AllSlotsBusy { in_use, total }) => {
                assert_eq!((in_use, total), (1, 1));
            }
            other => panic!("expected AllSlotsBusy, got {other:?}"),
        }
    }

    #[test]
    fn url_token_is_single_use() {
        let store = store_with_slots(1);
        let now = Instant::now();
        let assignment = store.request("c1", now).unwrap();

        let cookie = store
            .consume_url_token(&assignment.url_token, assignment.slot_id, now)
            .expect("first consume succeeds");
        assert!(store.grant_for_cookie(&cookie, assignment.slot_id));
        assert!(
            store
                .consume_url_token(&assignment.url_token, assignment.slot_id, now)
                .is_none(),
            "second consume must fail"
        );
    }

    #[test]
    fn url_token_is_slot_bound_and_expires() {
        let store = store_with_slots(2);
        let now = Instant::now();
        let a = store.request("c1", now).unwrap();
        assert!(store.consume_url_token(&a.url_token, 2, now).is_none());

        let b = store.check("c1", now).unwrap();
        let later = now + URL_TOKEN_TTL + Duration::from_secs(1);
        assert!(store.consume_url_token(&b.url_token, b.slot_id, later).is_none());
    }

    #[test]
    fn release_cascades_tokens_and_mappings() {
        let store = store_with_slots(1);
        let now = Instant::now();
        let assignment = store.request("c1", now).unwrap();
        let cookie = store
            .consume_url_token(&assignment.url_token, 1, now)
            .unwrap();
        let extra = store.check("c1", now).unwrap();

        let snapshot = store.release_client("c1").unwrap();
        assert!(!snapshot.in_use);
        assert!(!store.grant_for_cookie(&cookie, 1));
        assert!(store.consume_url_token(&extra.url_token, 1, now).is_none());
        assert!(store.check("c1", now).is_none());
    }

    #[test]
    fn reaper_releases_on_heartbeat_timeout() {
        let store = store_with_slots(1);
        let t0 = Instant::now();
        store.request("c1", t0).unwrap();

        let before = t0 + Duration::from_secs(299);
        assert!(store.reap(before).is_empty());

        let after = t0 + Duration::from_secs(330);
        let released = store.reap(after);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].slot_id, 1);
        assert_eq!(store.status().available, 1);
    }

    #[test]
    fn heartbeats_keep_a_session_alive() {
        let store = store_with_slots(1);
        let t0 = Instant::now();
        let a = store.request("c1", t0).unwrap();

        let t1 = t0 + Duration::from_secs(290);
        store.heartbeat_slot(a.slot_id, t1).unwrap();
        // ws presence would reap here, so simulate an attached socket.
        store.ws_connected(a.slot_id);

        let t2 = t0 + Duration::from_secs(400);
        assert!(store.reap(t2).is_empty());
    }

    #[test]
    fn reaper_releases_on_ws_absence_after_grace() {
        let store = store_with_slots(1);
        let t0 = Instant::now();
        let a = store.request("c1", t0).unwrap();

        // Inside the 60 s assignment grace: kept even with no sockets.
        assert!(store.reap(t0 + Duration::from_secs(59)).is_empty());

        // Heartbeats alone do not defeat the presence timeout.
        store.heartbeat_slot(a.slot_id, t0 + Duration::from_secs(100)).unwrap();
        let released = store.reap(t0 + Duration::from_secs(185));
        assert_eq!(released.len(), 1);
    }

    #[test]
    fn ws_presence_timer_starts_at_last_disconnect() {
        let store = store_with_slots(1);
        let t0 = Instant::now();
        let a = store.request("c1", t0).unwrap();
        store.ws_connected(a.slot_id);

        let t_disconnect = t0 + Duration::from_secs(500);
        store.heartbeat_slot(a.slot_id, t_disconnect).unwrap();
        store.ws_disconnected(a.slot_id, t_disconnect);

        assert!(store.reap(t_disconnect + Duration::from_secs(119)).is_empty());
        let released = store.reap(t_disconnect + Duration::from_secs(121));
        assert_eq!(released.len(), 1);
    }

    #[test]
    fn heartbeat_sampling_is_one_in_five() {
        let store = store_with_slots(1);
        let now = Instant::now();
        let a = store.request("c1", now).unwrap();
        let due: Vec<bool> = (0..10)
            .map(|_| store.heartbeat_slot(a.slot_id, now).unwrap())
            .collect();
        assert_eq!(due.iter().filter(|d| **d).count(), 2);
        assert!(due[4] && due[9]);
    }

    #[test]
    fn restore_remints_cookie_tokens() {
        let store = store_with_slots(2);
        let now = Instant::now();
        assert!(store.restore(2, "c9".into(), None, unix_now(), now));

        let assignment = store.check("c9", now).expect("restored session is live");
        assert_eq!(assignment.slot_id, 2);

        // A second restore of the same slot is refused.
        assert!(!store.restore(2, "c9".into(), None, unix_now(), now));
    }

    #[test]
    fn expired_url_tokens_are_garbage_collected() {
        let store = store_with_slots(1);
        let now = Instant::now();
        store.request("c1", now).unwrap();
        store.check("c1", now).unwrap();

        assert_eq!(store.gc_url_tokens(now), 0);
        let later = now + URL_TOKEN_TTL + Duration::from_secs(1);
        assert_eq!(store.gc_url_tokens(later), 2);
    }
}
