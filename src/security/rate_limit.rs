//! Per-IP authentication rate limiting with progressive backoff.
//!
//! Sliding window of 5 attempts per 5 minutes per IP. The sixth in-window
//! attempt locks the bucket for 15 minutes. Within the allowed attempts a
//! synthetic delay grows with the attempt count to blunt online brute
//! force. Process-local only.

use crate::Error;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Buckets idle longer than this are evicted by the sweeper.
const IDLE_EVICTION: Duration = Duration::from_secs(30 * 60);

/// Attempt count beyond which the progressive delay stops growing.
const DELAY_CAP_ATTEMPTS: u32 = 5;

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Sliding window length.
    pub window: Duration,
    /// Attempts allowed per window.
    pub max_attempts: usize,
    /// Lockout length once the limit is exceeded.
    pub lockout: Duration,
    /// Base unit of the progressive delay.
    pub base_delay: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(5 * 60),
            max_attempts: 5,
            lockout: Duration::from_secs(15 * 60),
            base_delay: Duration::from_millis(50),
        }
    }
}

/// Why an attempt was refused.
#[derive(Debug, Clone, Copy)]
pub struct RateLimited {
    /// Seconds until the lockout expires.
    pub retry_after_secs: u64,
    /// True when this refusal is the one that created the lockout;
    /// subsequent refusals while locked are repeat offenders.
    pub newly_locked: bool,
}

impl From<RateLimited> for Error {
    fn from(limited: RateLimited) -> Self {
        Self::TooManyRequests {
            retry_after_secs: limited.retry_after_secs,
        }
    }
}

#[derive(Debug, Default)]
struct Bucket {
    attempts: VecDeque<Instant>,
    locked_until: Option<Instant>,
    last_seen: Option<Instant>,
}

fn acquire<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Per-IP sliding-window rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    /// Concurrent map keyed by IP; each bucket carries its own mutex so a
    /// hot IP does not serialize the rest.
    buckets: Mutex<HashMap<IpAddr, Arc<Mutex<Bucket>>>>,
}

impl RateLimiter {
    /// Creates a limiter with the given configuration.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Registers an attempt from `ip` now. On success returns the
    /// progressive delay the caller must apply before responding.
    pub fn check(&self, ip: IpAddr) -> std::result::Result<Duration, RateLimited> {
        self.check_at(ip, Instant::now())
    }

    /// [`RateLimiter::check`] against an explicit clock, for tests.
    pub fn check_at(&self, ip: IpAddr, now: Instant) -> std::result::Result<Duration, RateLimited> {
        let bucket = self.bucket_for(ip);
        let mut bucket = acquire(&bucket);
        bucket.last_seen = Some(now);

        if let Some(until) = bucket.locked_until {
            if now < until {
                metrics::counter!("homegraph_rate_limit_rejections_total").increment(1);
                return Err(RateLimited {
                    retry_after_secs: retry_after(until, now),
                    newly_locked: false,
                });
            }
            bucket.locked_until = None;
            bucket.attempts.clear();
        }

        while bucket
            .attempts
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.config.window)
        {
            bucket.attempts.pop_front();
        }

        if bucket.attempts.len() >= self.config.max_attempts {
            let until = now + self.config.lockout;
            bucket.locked_until = Some(until);
            metrics::counter!("homegraph_rate_limit_lockouts_total").increment(1);
            return Err(RateLimited {
                retry_after_secs: retry_after(until, now),
                newly_locked: true,
            });
        }

        bucket.attempts.push_back(now);
        #[allow(clippy::cast_possible_truncation)]
        let multiplier = (bucket.attempts.len() as u32).min(DELAY_CAP_ATTEMPTS);
        Ok(self.config.base_delay * multiplier)
    }

    /// Registers an attempt and sleeps out the progressive delay.
    pub async fn acquire_slot(&self, ip: IpAddr) -> std::result::Result<(), RateLimited> {
        let delay = self.check(ip)?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    /// Evicts buckets idle for more than 30 minutes.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    /// [`RateLimiter::sweep`] against an explicit clock, for tests.
    pub fn sweep_at(&self, now: Instant) {
        let mut buckets = acquire(&self.buckets);
        buckets.retain(|_, bucket| {
            let bucket = acquire(bucket);
            bucket
                .last_seen
                .is_none_or(|seen| now.duration_since(seen) < IDLE_EVICTION)
        });
    }

    /// Number of tracked buckets.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        acquire(&self.buckets).len()
    }

    /// Spawns the background sweep task (runs every minute).
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                limiter.sweep();
            }
        })
    }

    fn bucket_for(&self, ip: IpAddr) -> Arc<Mutex<Bucket>> {
        let mut buckets = acquire(&self.buckets);
        Arc::clone(buckets.entry(ip).or_default())
    }
}

fn retry_after(until: Instant, now: Instant) -> u64 {
    until.duration_since(now).as_secs().max(1)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([192, 168, 1, last])
    }

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimitConfig::default())
    }

    #[test]
    fn test_five_attempts_allowed_sixth_locked() {
        let rl = limiter();
        let now = Instant::now();
        for _ in 0..5 {
            assert!(rl.check_at(ip(1), now).is_ok());
        }
        let refused = rl.check_at(ip(1), now).unwrap_err();
        assert!(refused.newly_locked);
        assert_eq!(refused.retry_after_secs, 15 * 60);
    }

    #[test]
    fn test_repeat_attempts_while_locked_are_not_newly_locked() {
        let rl = limiter();
        let now = Instant::now();
        for _ in 0..5 {
            let _ = rl.check_at(ip(1), now);
        }
        assert!(rl.check_at(ip(1), now).unwrap_err().newly_locked);
        let again = rl.check_at(ip(1), now + Duration::from_secs(30)).unwrap_err();
        assert!(!again.newly_locked);
        assert!(again.retry_after_secs <= 15 * 60 - 30);
    }

    #[test]
    fn test_lockout_expires() {
        let rl = limiter();
        let now = Instant::now();
        for _ in 0..6 {
            let _ = rl.check_at(ip(1), now);
        }
        // One second past the lockout, one attempt is admitted again.
        let later = now + Duration::from_secs(15 * 60 + 1);
        assert!(rl.check_at(ip(1), later).is_ok());
    }

    #[test]
    fn test_window_slides() {
        let rl = limiter();
        let now = Instant::now();
        for _ in 0..5 {
            let _ = rl.check_at(ip(1), now).unwrap();
        }
        // The old attempts age out of the 5-minute window.
        let later = now + Duration::from_secs(5 * 60);
        assert!(rl.check_at(ip(1), later).is_ok());
    }

    #[test]
    fn test_progressive_delay_grows_and_caps() {
        let rl = RateLimiter::new(RateLimitConfig {
            max_attempts: 10,
            ..RateLimitConfig::default()
        });
        let now = Instant::now();
        let base = Duration::from_millis(50);
        assert_eq!(rl.check_at(ip(1), now).unwrap(), base);
        assert_eq!(rl.check_at(ip(1), now).unwrap(), base * 2);
        for _ in 0..4 {
            let _ = rl.check_at(ip(1), now).unwrap();
        }
        // Seventh attempt: capped at base * 5.
        assert_eq!(rl.check_at(ip(1), now).unwrap(), base * 5);
    }

    #[test]
    fn test_buckets_are_per_ip() {
        let rl = limiter();
        let now = Instant::now();
        for _ in 0..6 {
            let _ = rl.check_at(ip(1), now);
        }
        assert!(rl.check_at(ip(2), now).is_ok());
        assert_eq!(rl.bucket_count(), 2);
    }

    #[test]
    fn test_sweep_evicts_idle_buckets() {
        let rl = limiter();
        let now = Instant::now();
        let _ = rl.check_at(ip(1), now);
        let _ = rl.check_at(ip(2), now + Duration::from_secs(29 * 60));
        rl.sweep_at(now + Duration::from_secs(31 * 60));
        assert_eq!(rl.bucket_count(), 1);
    }
}
