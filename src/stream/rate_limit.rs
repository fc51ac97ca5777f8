//! Pre-auth stream rate limiting.
//!
//! This is the cheap first gate in front of the stream endpoint: a
//! fixed-window counter keyed on a best-effort token subject (decoded
//! without signature verification) with fallback to the peer network
//! address. It runs before any signature, ownership or capacity check
//! and exists only to blunt connection floods; the real authorization
//! happens afterwards.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use crate::modules::capability;

struct WindowSlot {
    window_start: Instant,
    count: u32,
}

pub struct StreamRateLimiter {
    max_per_window: u32,
    window: Duration,
    slots: StdMutex<HashMap<String, WindowSlot>>,
}

impl StreamRateLimiter {
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            slots: StdMutex::new(HashMap::new()),
        }
    }

    /// Count one attempt for `key`. Returns false when the key is over
    /// budget for the current window.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut slots = self.slots.lock().expect("rate limiter mutex poisoned");

        // Opportunistic cleanup so idle keys do not accumulate.
        if slots.len() > 4096 {
            let window = self.window;
            slots.retain(|_, slot| now.duration_since(slot.window_start) < window);
        }

        let slot = slots.entry(key.to_string()).or_insert(WindowSlot {
            window_start: now,
            count: 0,
        });
        if now.duration_since(slot.window_start) >= self.window {
            slot.window_start = now;
            slot.count = 0;
        }
        slot.count += 1;
        slot.count <= self.max_per_window
    }
}

/// Limiter key for a connection attempt: the unverified token subject
/// when one can be decoded, otherwise the peer address.
pub fn limiter_key(token: Option<&str>, peer: IpAddr) -> String {
    token
        .and_then(capability::peek_subject)
        .map(|sub| format!("sub:{sub}"))
        .unwrap_or_else(|| format!("ip:{peer}"))
}
