use std::cmp::min;
use std::time::Duration;

use crate::config::ReconnectConfig;

/// Delay sequence for reconnect attempts: doubling per failed attempt, capped at the configured
///  maximum, reset once a connection makes it through the handshake.
pub struct ReconnectBackoff {
    next: Duration,
    config_initial_delay: Duration,
    config_max_delay: Duration,
}

impl ReconnectBackoff {
    pub fn new(config: &ReconnectConfig) -> ReconnectBackoff {
        ReconnectBackoff {
            next: config.initial_delay,
            config_initial_delay: config.initial_delay,
            config_max_delay: config.max_delay,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let result = self.next;
        self.next = min(self.next * 2, self.config_max_delay);
        result
    }

    pub fn reset(&mut self) {
        self.next = self.config_initial_delay;
    }
}
