use std::time::Duration;

use anyhow::bail;

use crate::node_id::NodeId;

/// All tunables of a socket. The defaults are sensible for LAN deployments; the timing knobs
///  mostly trade latency against overhead.
#[derive(Clone, Debug)]
pub struct SocketConfig {
    /// this socket's identity, exchanged during the Initialize handshake. Generated randomly
    ///  by [SocketConfig::new], but applications can pin it for stable identities across restarts.
    pub node_id: NodeId,

    /// interval at which a channel sends a Heartbeat letter when it has nothing else to send
    pub heartbeat_interval: Duration,

    /// a channel that received nothing for this long is considered dead and torn down. Must be
    ///  comfortably bigger than `heartbeat_interval` to tolerate jitter.
    pub liveness_timeout: Duration,

    /// upper bound for an encoded letter on the wire. Anything bigger is treated as a protocol
    ///  error, and the channel is torn down.
    pub max_letter_size: usize,

    /// capacity of each channel's inbox of letters waiting to be sent
    pub channel_queue_size: usize,

    pub batch: BatchConfig,
    pub reconnect: ReconnectConfig,

    /// how long a typed request waits for its reply before failing. `None` waits indefinitely.
    pub reply_timeout: Option<Duration>,
}

/// Micro-batching: letters enqueued in quick succession are folded into a single Batch letter
///  to cut per-frame overhead on chatty connections.
#[derive(Clone, Debug)]
pub struct BatchConfig {
    pub enabled: bool,

    /// sliding window - each enqueued letter pushes the flush out by this much
    pub extend: Duration,

    /// hard bound on how long a letter may sit in the batch, counted from the first enqueue
    pub max_extend: Duration,

    /// flush immediately once this many letters have accumulated
    pub max_letters: usize,
}

#[derive(Clone, Debug)]
pub struct ReconnectConfig {
    /// delay before the first reconnect attempt after a connection is lost
    pub initial_delay: Duration,

    /// cap for the exponentially growing delay between attempts
    pub max_delay: Duration,
}

impl SocketConfig {
    pub fn new() -> SocketConfig {
        SocketConfig {
            node_id: NodeId::random(),
            heartbeat_interval: Duration::from_millis(500),
            liveness_timeout: Duration::from_secs(5),
            max_letter_size: 16*1024*1024,
            channel_queue_size: 64,
            batch: BatchConfig {
                enabled: true,
                extend: Duration::from_millis(100),
                max_extend: Duration::from_secs(1),
                max_letters: 4000,
            },
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(30),
            },
            reply_timeout: Some(Duration::from_secs(30)),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.liveness_timeout <= self.heartbeat_interval {
            bail!("liveness timeout must be bigger than the heartbeat interval");
        }
        if self.channel_queue_size == 0 {
            bail!("channel queue size must be at least 1");
        }
        if self.batch.max_letters < 2 {
            bail!("a batch of fewer than 2 letters is pointless");
        }
        if self.batch.max_extend < self.batch.extend {
            bail!("max_extend must be at least as big as extend");
        }
        if self.reconnect.max_delay < self.reconnect.initial_delay {
            bail!("max reconnect delay must be at least as big as the initial delay");
        }
        Ok(())
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self::new()
    }
}
