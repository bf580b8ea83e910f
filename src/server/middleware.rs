//! Per-IP rate limiting.

use std::net::{IpAddr, Ipv6Addr};
use std::num::{NonZeroU32, NonZeroUsize};
use std::sync::Arc;

use governor::{Quota, RateLimiter};
use lru::LruCache;
use tokio::sync::Mutex;

use super::types::ServerConfig;

pub type IpRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

pub type RateLimiterCache = Mutex<LruCache<IpAddr, Arc<IpRateLimiter>>>;

/// Maximum number of per-IP rate limiter entries to keep in the LRU cache.
const MAX_RATE_LIMITER_ENTRIES: NonZeroUsize = match NonZeroUsize::new(10_000) {
    Some(n) => n,
    None => unreachable!(),
};

/// IPv6 addresses are grouped by /64 so a single host cannot rotate addresses.
fn limiter_key(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => ip,
        IpAddr::V6(v6) => {
            let seg = v6.segments();
            IpAddr::V6(Ipv6Addr::new(seg[0], seg[1], seg[2], seg[3], 0, 0, 0, 0))
        }
    }
}

/// Get or create a rate limiter for the given IP.
/// Returns `None` when rate limiting is disabled.
pub async fn get_rate_limiter(
    config: &ServerConfig,
    rate_limiters: &RateLimiterCache,
    ip: IpAddr,
) -> Option<Arc<IpRateLimiter>> {
    let rpm = NonZeroU32::new(config.rate_limit_rpm)?;
    let key = limiter_key(ip);

    let mut limiters = rate_limiters.lock().await;

    if let Some(limiter) = limiters.get(&key) {
        return Some(Arc::clone(limiter));
    }

    let quota = Quota::per_minute(rpm);
    let limiter = Arc::new(RateLimiter::direct(quota));
    limiters.push(key, Arc::clone(&limiter));

    Some(limiter)
}

/// True if `ip` is over its per-minute budget.
pub async fn is_rate_limited(config: &ServerConfig, rate_limiters: &RateLimiterCache, ip: IpAddr) -> bool {
    match get_rate_limiter(config, rate_limiters, ip).await {
        Some(limiter) => limiter.check().is_err(),
        None => false,
    }
}

pub fn new_rate_limiter_cache() -> RateLimiterCache {
    Mutex::new(LruCache::new(MAX_RATE_LIMITER_ENTRIES))
}
