use std::convert::TryFrom;
use tokio::time::Duration;

/// Tunables for the HA stack. Everything is optional; defaults are the
/// production values and the validation only keeps the relations between
/// them sane (floors below caps, the silence threshold above the intervals
/// that feed it).
#[derive(Clone, Default)]
pub struct HaOptions {
    pub election_poll_floor: Option<Duration>,
    pub election_poll_cap: Option<Duration>,
    pub bootstrap_backoff_floor: Option<Duration>,
    pub bootstrap_backoff_cap: Option<Duration>,
    pub announce_interval: Option<Duration>,
    pub collect_interval: Option<Duration>,
    pub housekeeping_interval: Option<Duration>,
    pub silence_threshold: Option<Duration>,
    pub dial_retry_floor: Option<Duration>,
    pub dial_retry_cap: Option<Duration>,
    pub handshake_timeout: Option<Duration>,
    pub write_stall_cap: Option<Duration>,
    pub kicked_out_grace: Option<Duration>,
    pub outbound_queue_capacity: Option<usize>,
}

#[derive(Clone)]
pub(crate) struct HaOptionsValidated {
    pub election_poll_floor: Duration,
    pub election_poll_cap: Duration,
    pub bootstrap_backoff_floor: Duration,
    pub bootstrap_backoff_cap: Duration,
    pub announce_interval: Duration,
    pub collect_interval: Duration,
    pub housekeeping_interval: Duration,
    pub silence_threshold: Duration,
    pub dial_retry_floor: Duration,
    pub dial_retry_cap: Duration,
    pub handshake_timeout: Duration,
    pub write_stall_cap: Duration,
    pub kicked_out_grace: Duration,
    pub outbound_queue_capacity: usize,
}

impl HaOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.election_poll_floor >= self.election_poll_cap {
            return Err("Election poll floor must be less than its cap");
        }
        if self.bootstrap_backoff_floor >= self.bootstrap_backoff_cap {
            return Err("Bootstrap backoff floor must be less than its cap");
        }
        if self.dial_retry_floor >= self.dial_retry_cap {
            return Err("Dial retry floor must be less than its cap");
        }
        if self.silence_threshold <= self.housekeeping_interval {
            return Err("Silence threshold must exceed the housekeeping interval");
        }
        if self.silence_threshold <= self.announce_interval {
            return Err("Silence threshold must exceed the announce interval");
        }
        if self.silence_threshold <= self.collect_interval {
            return Err("Silence threshold must exceed the collect interval");
        }
        if self.outbound_queue_capacity == 0 {
            return Err("Outbound queue capacity must be non-zero");
        }

        Ok(())
    }
}

impl TryFrom<HaOptions> for HaOptionsValidated {
    type Error = &'static str;

    fn try_from(options: HaOptions) -> Result<Self, Self::Error> {
        let values = HaOptionsValidated {
            election_poll_floor: options.election_poll_floor.unwrap_or(Duration::from_millis(200)),
            election_poll_cap: options.election_poll_cap.unwrap_or(Duration::from_secs(60)),
            bootstrap_backoff_floor: options.bootstrap_backoff_floor.unwrap_or(Duration::from_secs(1)),
            bootstrap_backoff_cap: options.bootstrap_backoff_cap.unwrap_or(Duration::from_secs(32)),
            announce_interval: options.announce_interval.unwrap_or(Duration::from_secs(30)),
            collect_interval: options.collect_interval.unwrap_or(Duration::from_secs(40)),
            housekeeping_interval: options.housekeeping_interval.unwrap_or(Duration::from_secs(10)),
            silence_threshold: options.silence_threshold.unwrap_or(Duration::from_secs(120)),
            dial_retry_floor: options.dial_retry_floor.unwrap_or(Duration::from_millis(500)),
            dial_retry_cap: options.dial_retry_cap.unwrap_or(Duration::from_secs(8)),
            handshake_timeout: options.handshake_timeout.unwrap_or(Duration::from_secs(5)),
            write_stall_cap: options.write_stall_cap.unwrap_or(Duration::from_secs(5)),
            kicked_out_grace: options.kicked_out_grace.unwrap_or(Duration::from_secs(300)),
            outbound_queue_capacity: options.outbound_queue_capacity.unwrap_or(64),
        };

        values.validate()?;
        Ok(values)
    }
}
