//! Handshake load detection and cookie-reply pacing
//!
//! Two token buckets guard the handshake path. The first measures overall
//! handshake-message load; once it runs dry the responder demands cookies
//! instead of doing curve operations for strangers. The second paces the
//! cookie replies themselves: at most one per source every quarter second,
//! under a shared global cap, so the mitigation cannot itself be used to
//! amplify traffic.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Handshake messages per second considered normal load.
pub const HANDSHAKES_PER_SEC: u32 = 100;

/// Minimum spacing between cookie replies to one source.
pub const COOKIE_REPLY_INTERVAL: Duration = Duration::from_millis(250);

/// Global cookie replies per second across all sources.
pub const COOKIE_REPLIES_PER_SEC: u32 = 64;

/// Entries in the per-source table before it is swept.
const SOURCE_TABLE_LIMIT: usize = 4096;

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    per_sec: f64,
    refilled: Instant,
}

impl TokenBucket {
    fn new(per_sec: u32) -> Self {
        Self {
            capacity: f64::from(per_sec),
            tokens: f64::from(per_sec),
            per_sec: f64::from(per_sec),
            refilled: Instant::now(),
        }
    }

    fn try_take(&mut self, now: Instant) -> bool {
        let elapsed = now.duration_since(self.refilled).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.per_sec).min(self.capacity);
        self.refilled = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct Inner {
    load: TokenBucket,
    replies: TokenBucket,
    last_reply: HashMap<IpAddr, Instant>,
}

/// Shared limiter owned by the device.
pub struct RateLimiter {
    inner: Mutex<Inner>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                load: TokenBucket::new(HANDSHAKES_PER_SEC),
                replies: TokenBucket::new(COOKIE_REPLIES_PER_SEC),
                last_reply: HashMap::new(),
            }),
        }
    }

    /// Account one handshake message; `true` means the device is under
    /// load and should insist on valid cookies.
    pub fn under_load(&self) -> bool {
        !self.inner.lock().load.try_take(Instant::now())
    }

    /// Whether a cookie reply to `src` is allowed right now. Consumes the
    /// budget when it is.
    pub fn allow_cookie_reply(&self, src: IpAddr) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if let Some(last) = inner.last_reply.get(&src) {
            if now.duration_since(*last) < COOKIE_REPLY_INTERVAL {
                return false;
            }
        }
        if !inner.replies.try_take(now) {
            return false;
        }

        if inner.last_reply.len() >= SOURCE_TABLE_LIMIT {
            inner
                .last_reply
                .retain(|_, at| now.duration_since(*at) < COOKIE_REPLY_INTERVAL);
        }
        inner.last_reply.insert(src, now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, last))
    }

    #[test]
    fn load_bucket_trips_after_burst() {
        let limiter = RateLimiter::new();
        let mut tripped = false;
        for _ in 0..=HANDSHAKES_PER_SEC {
            if limiter.under_load() {
                tripped = true;
                break;
            }
        }
        assert!(tripped);
    }

    #[test]
    fn one_reply_per_source_per_interval() {
        let limiter = RateLimiter::new();
        assert!(limiter.allow_cookie_reply(ip(1)));
        assert!(!limiter.allow_cookie_reply(ip(1)));
        // A different source has its own budget.
        assert!(limiter.allow_cookie_reply(ip(2)));
    }

    #[test]
    fn global_cap_bounds_distinct_sources() {
        let limiter = RateLimiter::new();
        let mut allowed = 0u32;
        for n in 0..255u8 {
            if limiter.allow_cookie_reply(ip(n)) {
                allowed += 1;
            }
        }
        assert!(allowed <= COOKIE_REPLIES_PER_SEC + 1);
    }

    #[test]
    fn bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(4);
        let start = Instant::now();
        for _ in 0..4 {
            assert!(bucket.try_take(start));
        }
        assert!(!bucket.try_take(start));
        assert!(bucket.try_take(start + Duration::from_millis(300)));
    }
}
