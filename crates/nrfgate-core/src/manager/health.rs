//! Connection health estimation
//!
//! Estimates radio packet loss per device from the `MSG_NUM` sequence numbers
//! the gateway actually received. Each device has a bounded window holding a
//! monotonic run of sequence numbers since the last reset; numbers missing
//! between the window's minimum and maximum count as lost.

use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

use crate::message::DeviceUuid;

/// Default number of sequence numbers kept per device
pub const DEFAULT_WINDOW: usize = 20;

/// Per-device sliding windows of received sequence numbers
#[derive(Debug, Clone)]
pub struct ConnectionHealth {
    capacity: usize,
    windows: HashMap<DeviceUuid, VecDeque<u8>>,
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl ConnectionHealth {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            windows: HashMap::new(),
        }
    }

    /// Record sequence number `n` for `uuid` and return the updated score
    pub fn record(&mut self, uuid: DeviceUuid, n: u8) -> f64 {
        let capacity = self.capacity;
        let window = self.windows.entry(uuid).or_default();

        match window.iter().max().copied() {
            None => window.push_back(n),
            Some(max) if n == 0 || n < max => {
                debug!(uuid = %uuid, msg_num = n, "Sequence reset");
                window.clear();
                window.push_back(0);
            }
            Some(_) if window.contains(&n) => {
                warn!(uuid = %uuid, msg_num = n, "Repeated sequence number");
            }
            Some(_) => {
                window.push_back(n);
                while window.len() > capacity {
                    window.pop_front();
                }
            }
        }

        score(window)
    }

    /// Current score for `uuid`, if any sequence number was seen
    pub fn score(&self, uuid: &DeviceUuid) -> Option<f64> {
        self.windows.get(uuid).map(score)
    }

    /// Window contents, oldest first
    pub fn window(&self, uuid: &DeviceUuid) -> Option<Vec<u8>> {
        self.windows.get(uuid).map(|w| w.iter().copied().collect())
    }

    /// Forget a device
    pub fn remove(&mut self, uuid: &DeviceUuid) {
        self.windows.remove(uuid);
    }
}

/// `1 - missing / (len + missing)`, rounded to two decimals
fn score(window: &VecDeque<u8>) -> f64 {
    let (Some(&min), Some(&max)) = (window.iter().min(), window.iter().max()) else {
        return 1.0;
    };
    let missing = (min..=max).filter(|n| !window.contains(n)).count();
    let health = 1.0 - missing as f64 / (window.len() + missing) as f64;
    (health * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const UUID: DeviceUuid = DeviceUuid::new([1, 2, 3, 4]);

    fn feed(health: &mut ConnectionHealth, nums: &[u8]) -> f64 {
        let mut last = 0.0;
        for &n in nums {
            last = health.record(UUID, n);
        }
        last
    }

    #[test]
    fn test_contiguous_run_is_healthy() {
        let mut health = ConnectionHealth::default();
        assert_eq!(feed(&mut health, &[0, 1, 2, 3]), 1.0);
        assert_eq!(health.window(&UUID), Some(vec![0, 1, 2, 3]));
    }

    #[test]
    fn test_one_gap() {
        let mut health = ConnectionHealth::default();
        assert_eq!(feed(&mut health, &[0, 2, 3]), 0.75);
    }

    #[test]
    fn test_zero_resets_window() {
        let mut health = ConnectionHealth::default();
        feed(&mut health, &[5, 6, 9]);
        assert_eq!(health.record(UUID, 0), 1.0);
        assert_eq!(health.window(&UUID), Some(vec![0]));
    }

    #[test]
    fn test_rollback_resets_window() {
        let mut health = ConnectionHealth::default();
        feed(&mut health, &[10, 11, 12]);
        health.record(UUID, 4);
        assert_eq!(health.window(&UUID), Some(vec![0]));
    }

    #[test]
    fn test_repeat_is_not_double_counted() {
        let mut health = ConnectionHealth::default();
        feed(&mut health, &[1, 2, 3, 3]);
        assert_eq!(health.window(&UUID), Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_window_is_bounded() {
        let mut health = ConnectionHealth::new(4);
        let nums: Vec<u8> = (1..=10).collect();
        assert_eq!(feed(&mut health, &nums), 1.0);
        assert_eq!(health.window(&UUID), Some(vec![7, 8, 9, 10]));
    }

    #[test]
    fn test_rounding() {
        let mut health = ConnectionHealth::default();
        // window [0, 1, 5]: 3 missing of 6
        assert_eq!(feed(&mut health, &[0, 1, 5]), 0.5);
        // window [0, 1, 5, 6]: 3 missing of 7 -> 0.5714...
        assert_eq!(health.record(UUID, 6), 0.57);
    }
}
