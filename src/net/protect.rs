// Cash Hub: Bitcoin-Cash full-node Hub core.
//
// SPDX-License-Identifier: MIT

//! Flood/ban scoring for inbound connection attempts. Tracks
//! recent connection timestamps per IP across three sliding windows and
//! accumulates a penalty score that decays over time and bans an address
//! once it crosses a threshold.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const WINDOW_10S: Duration = Duration::from_secs(10);
const WINDOW_30S: Duration = Duration::from_secs(30);
const WINDOW_90S: Duration = Duration::from_secs(90);

const THRESHOLD_10S: usize = 1;
const THRESHOLD_30S: usize = 1;
const THRESHOLD_90S: usize = 2;

const PENALTY_PER_VIOLATION: u32 = 10;
const BAN_SCORE: u32 = 1000;
const BAN_DURATION: Duration = Duration::from_secs(24 * 3600);
const DECAY_PER_HOUR: u32 = 100;

struct IpState {
    recent: Vec<Instant>,
    score: u32,
    last_decay: Instant,
    /// Set when `score` first crosses [`BAN_SCORE`]; cleared once
    /// `Instant::now()` passes it. An address already in the `recent`
    /// vec's window keeps accumulating points while banned, matching the
    /// original's behavior of only ever extending a ban, never shortening
    /// it (this reimplementation resolves the original's known off-by-one,
    /// where the ban was computed from `now + timeout` and so was
    /// re-extended by any stray packet rather than expiring at a fixed
    /// instant).
    banned_until: Option<Instant>,
}

impl IpState {
    fn new(now: Instant) -> Self { Self { recent: Vec::new(), score: 0, last_decay: now, banned_until: None } }

    fn decay(&mut self, now: Instant) {
        let elapsed_hours = now.duration_since(self.last_decay).as_secs() / 3600;
        if elapsed_hours == 0 {
            return;
        }
        let decayed = (elapsed_hours as u32).saturating_mul(DECAY_PER_HOUR);
        self.score = self.score.saturating_sub(decayed);
        self.last_decay = now;
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ProtectVerdict {
    Allow,
    Banned,
}

/// Shared flood/ban tracker consulted on every inbound accept.
pub struct NetProtect {
    ips: Mutex<HashMap<IpAddr, IpState>>,
    whitelist: Mutex<std::collections::HashSet<IpAddr>>,
}

impl Default for NetProtect {
    fn default() -> Self { Self { ips: Mutex::new(HashMap::new()), whitelist: Mutex::new(std::collections::HashSet::new()) } }
}

impl NetProtect {
    pub fn new() -> Self { Self::default() }

    /// Exempts `ip` from scoring and bans entirely, in addition to the
    /// always-exempt loopback addresses.
    pub fn whitelist(&self, ip: IpAddr) { self.whitelist.lock().unwrap().insert(ip); }

    fn is_exempt(&self, ip: IpAddr) -> bool { ip.is_loopback() || self.whitelist.lock().unwrap().contains(&ip) }

    /// Records a connection attempt from `ip` at `now` and returns whether
    /// it should be accepted. Loopback and whitelisted addresses always pass
    /// without being scored.
    pub fn record_connection(&self, ip: IpAddr, now: Instant) -> ProtectVerdict {
        if self.is_exempt(ip) {
            return ProtectVerdict::Allow;
        }

        let mut ips = self.ips.lock().unwrap();
        let state = ips.entry(ip).or_insert_with(|| IpState::new(now));
        state.decay(now);

        if let Some(until) = state.banned_until {
            if now < until {
                return ProtectVerdict::Banned;
            }
            state.banned_until = None;
        }

        state.recent.retain(|t| now.duration_since(*t) < WINDOW_90S);
        state.recent.push(now);

        let hits_10s = state.recent.iter().filter(|t| now.duration_since(**t) < WINDOW_10S).count();
        let hits_30s = state.recent.iter().filter(|t| now.duration_since(**t) < WINDOW_30S).count();
        let hits_90s = state.recent.len();

        let mut violations = 0;
        if hits_10s > THRESHOLD_10S {
            violations += 1;
        }
        if hits_30s > THRESHOLD_30S {
            violations += 1;
        }
        if hits_90s > THRESHOLD_90S {
            violations += 1;
        }
        state.score = state.score.saturating_add(violations * PENALTY_PER_VIOLATION);

        if state.score >= BAN_SCORE {
            state.banned_until = Some(now + BAN_DURATION);
            return ProtectVerdict::Banned;
        }
        ProtectVerdict::Allow
    }

    pub fn score_of(&self, ip: IpAddr) -> u32 { self.ips.lock().unwrap().get(&ip).map(|s| s.score).unwrap_or(0) }

    pub fn is_banned(&self, ip: IpAddr, now: Instant) -> bool {
        self.ips.lock().unwrap().get(&ip).and_then(|s| s.banned_until).map(|until| now < until).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> IpAddr { "203.0.113.7".parse().unwrap() }

    #[test]
    fn a_single_connection_is_always_allowed() {
        let protect = NetProtect::new();
        assert_eq!(protect.record_connection(ip(), Instant::now()), ProtectVerdict::Allow);
    }

    #[test]
    fn loopback_is_never_scored_or_banned() {
        let protect = NetProtect::new();
        let loopback: IpAddr = "127.0.0.1".parse().unwrap();
        let base = Instant::now();
        for i in 0..500u64 {
            let verdict = protect.record_connection(loopback, base + Duration::from_millis(i * 10));
            assert_eq!(verdict, ProtectVerdict::Allow);
        }
        assert_eq!(protect.score_of(loopback), 0);
    }

    #[test]
    fn whitelisted_ip_is_never_scored_or_banned() {
        let protect = NetProtect::new();
        let trusted = ip();
        protect.whitelist(trusted);
        let base = Instant::now();
        for i in 0..500u64 {
            let verdict = protect.record_connection(trusted, base + Duration::from_millis(i * 10));
            assert_eq!(verdict, ProtectVerdict::Allow);
        }
        assert_eq!(protect.score_of(trusted), 0);
    }

    #[test]
    fn rapid_reconnects_accumulate_score() {
        let protect = NetProtect::new();
        let base = Instant::now();
        for i in 0..5 {
            protect.record_connection(ip(), base + Duration::from_millis(i * 100));
        }
        assert!(protect.score_of(ip()) > 0);
    }

    #[test]
    fn crossing_the_ban_threshold_bans_for_24_hours() {
        let protect = NetProtect::new();
        let base = Instant::now();
        let mut now = base;
        let mut verdict = ProtectVerdict::Allow;
        for i in 0..200u64 {
            now = base + Duration::from_millis(i * 50);
            verdict = protect.record_connection(ip(), now);
            if verdict == ProtectVerdict::Banned {
                break;
            }
        }
        assert_eq!(verdict, ProtectVerdict::Banned);
        assert!(protect.is_banned(ip(), now));
        assert!(!protect.is_banned(ip(), now + BAN_DURATION + Duration::from_secs(1)));
    }

    #[test]
    fn score_decays_over_time() {
        let protect = NetProtect::new();
        let base = Instant::now();
        for i in 0..10 {
            protect.record_connection(ip(), base + Duration::from_millis(i * 100));
        }
        let scored = protect.score_of(ip());
        assert!(scored > 0);
        // force a decay pass by recording one more attempt two hours later
        protect.record_connection(ip(), base + Duration::from_secs(2 * 3600 + 1));
        assert!(protect.score_of(ip()) < scored);
    }
}
