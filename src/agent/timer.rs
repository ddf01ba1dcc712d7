use rand::Rng;
use std::time::Duration;

/// Random pause before contesting leadership again, so agents that saw the
/// same failure do not all race for the key at once.
pub fn random_negotiation_delay(min_ms: u64, max_ms: u64) -> Duration {
    if max_ms <= min_ms {
        return Duration::from_millis(min_ms);
    }
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(min_ms..=max_ms))
}
