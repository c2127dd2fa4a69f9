use std::net::IpAddr;
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::time::Instant;

/// Gates new connection attempts by IP address: a ban list with optional expiry, a list of
///  addresses that are exempt from connection frequency limits, and the limit itself.
///
/// Established connections are not affected by anything in here.
pub struct SecurityLists {
    /// `None` for bans that do not expire
    banned: FxHashMap<IpAddr, Option<Instant>>,
    exceptions: FxHashMap<IpAddr, ()>,
    limit_connection_frequency: bool,
    frequency_window: Duration,
    recent_attempts: FxHashMap<IpAddr, Instant>,
}

impl SecurityLists {
    pub fn new(frequency_window: Duration) -> SecurityLists {
        SecurityLists {
            banned: FxHashMap::default(),
            exceptions: FxHashMap::default(),
            limit_connection_frequency: false,
            frequency_window,
            recent_attempts: FxHashMap::default(),
        }
    }

    /// `duration` of zero bans permanently
    pub fn ban(&mut self, ip: IpAddr, duration: Duration, now: Instant) {
        let expiry = if duration.is_zero() {
            None
        }
        else {
            Some(now + duration)
        };
        self.banned.insert(ip, expiry);
    }

    pub fn unban(&mut self, ip: &IpAddr) {
        self.banned.remove(ip);
    }

    pub fn clear_bans(&mut self) {
        self.banned.clear();
    }

    /// Expired bans are removed lazily when they are checked
    pub fn is_banned(&mut self, ip: &IpAddr, now: Instant) -> bool {
        match self.banned.get(ip) {
            None => false,
            Some(None) => true,
            Some(Some(expiry)) if *expiry > now => true,
            Some(Some(_)) => {
                self.banned.remove(ip);
                false
            }
        }
    }

    pub fn add_exception(&mut self, ip: IpAddr) {
        self.exceptions.insert(ip, ());
    }

    pub fn remove_exception(&mut self, ip: &IpAddr) {
        self.exceptions.remove(ip);
    }

    pub fn is_exception(&self, ip: &IpAddr) -> bool {
        self.exceptions.contains_key(ip)
    }

    pub fn set_limit_connection_frequency(&mut self, limit: bool) {
        self.limit_connection_frequency = limit;
        if !limit {
            self.recent_attempts.clear();
        }
    }

    /// Registers a connection attempt, returning `true` if it comes too soon after the previous
    ///  one from the same IP address. Loopback addresses and exceptions are never limited.
    pub fn register_attempt(&mut self, ip: IpAddr, now: Instant) -> bool {
        if !self.limit_connection_frequency || ip.is_loopback() || self.is_exception(&ip) {
            return false;
        }

        let window = self.frequency_window;
        self.recent_attempts.retain(|_, at| now.duration_since(*at) < window);

        match self.recent_attempts.get(&ip) {
            Some(_) => true,
            None => {
                self.recent_attempts.insert(ip, now);
                false
            }
        }
    }
}
