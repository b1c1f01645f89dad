use std::time::SystemTime;

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Returns the current unix timestamp in microseconds
#[inline]
pub fn timestamp_usec() -> u64 {
    let elapsed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised");

    elapsed.as_secs() * 1_000_000 + u64::from(elapsed.subsec_micros())
}

/// The time seed for a given wall-clock second. Peers with synchronized
/// clocks agree on the seed without any exchange.
#[inline]
pub fn seed_for(now_sec: u64, window_sec: u64) -> u32 {
    (now_sec / window_sec.max(1)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_stable_within_window() {
        assert_eq!(seed_for(3600, 3600), seed_for(7199, 3600));
        assert_ne!(seed_for(3600, 3600), seed_for(7200, 3600));
    }

    #[test]
    fn test_seed_zero_window() {
        // A zero window must not divide by zero.
        let _ = seed_for(1234, 0);
    }
}
