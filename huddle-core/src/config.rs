use std::time::Duration;

/// The configuration of the session registry
#[derive(Debug, Clone)]
pub struct Config {
    /// The peer limit of rooms created without one
    pub default_peer_limit: usize,
    /// The smallest peer limit a room can be created with
    pub min_peer_limit: usize,
    /// The largest peer limit a room can be created with
    pub max_peer_limit: usize,
    /// How long an empty session is kept before it is evicted, zero evicts immediately
    pub eviction_grace_in_seconds: f32,
    /// How many times a join looks a room up again after the session it got was retired
    pub hydration_attempts: usize,
}

impl Config {
    /// Clamps a requested peer limit into the allowed range, falling back to the default
    pub fn clamp_peer_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_peer_limit)
            .clamp(self.min_peer_limit, self.max_peer_limit)
    }

    /// Returns the eviction grace period, if any
    pub fn eviction_grace(&self) -> Option<Duration> {
        (self.eviction_grace_in_seconds > 0.)
            .then(|| Duration::from_secs_f32(self.eviction_grace_in_seconds))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_peer_limit: 4,
            // A meeting needs at least two people
            min_peer_limit: 2,
            // Every peer holds a media connection to every other peer, so this stays small
            max_peer_limit: 8,
            eviction_grace_in_seconds: 0.,
            hydration_attempts: 3,
        }
    }
}

#[cfg(test)]
mod test {
    use super::Config;

    #[test]
    fn peer_limits_are_clamped() {
        let config = Config::default();

        assert_eq!(config.clamp_peer_limit(None), 4);
        assert_eq!(config.clamp_peer_limit(Some(1)), 2);
        assert_eq!(config.clamp_peer_limit(Some(5)), 5);
        assert_eq!(config.clamp_peer_limit(Some(100)), 8);
    }

    #[test]
    fn zero_grace_means_immediate_eviction() {
        let mut config = Config::default();
        assert!(config.eviction_grace().is_none());

        config.eviction_grace_in_seconds = 1.5;
        assert_eq!(config.eviction_grace().unwrap().as_millis(), 1500);
    }
}
