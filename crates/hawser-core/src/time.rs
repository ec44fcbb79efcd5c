//! Clock helpers shared by the protocol envelope and command timing.
//!
//! Envelope timestamps, token expiries, and handshake skew checks all use
//! second resolution; command duration reporting uses milliseconds.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix timestamp in seconds.
///
/// # Panics
/// Panics if the system clock is set before the Unix epoch, which would
/// indicate a severely misconfigured host.
///
/// # Examples
/// ```
/// use hawser_core::time::current_time_secs;
///
/// assert!(current_time_secs() > 0);
/// ```
pub fn current_time_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before UNIX epoch")
        .as_secs()
}

/// Current Unix timestamp in milliseconds.
///
/// # Panics
/// Panics if the system clock is set before the Unix epoch.
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before UNIX epoch")
        .as_millis() as u64
}

/// Milliseconds elapsed since `since`, saturating to 0 if `since` is in
/// the future (the clock may step backwards under NTP correction).
pub fn elapsed_millis(since: u64) -> u64 {
    current_time_millis().saturating_sub(since)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secs_and_millis_agree() {
        let secs = current_time_secs();
        let millis = current_time_millis();
        let diff = (millis / 1000).abs_diff(secs);
        assert!(diff <= 1, "seconds and milliseconds clocks diverge: {diff}");
    }

    #[test]
    fn test_elapsed_millis_advances() {
        let start = current_time_millis();
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(elapsed_millis(start) >= 10);
    }

    #[test]
    fn test_elapsed_millis_future_timestamp_saturates() {
        let future = current_time_millis() + 1_000_000;
        assert_eq!(elapsed_millis(future), 0);
    }
}
