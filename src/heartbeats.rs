use log::trace;
use std::time::{Duration, Instant};

const MAX_MISSED_SERVER_HEARTBEATS: u32 = 2;

#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) enum HeartbeatState {
    StillRunning,
    Expired,
}

#[derive(Debug)]
struct Heartbeat {
    last: Instant,
    interval: Duration,
}

impl Heartbeat {
    fn start(interval: Duration, now: Instant) -> Heartbeat {
        assert!(
            interval > Duration::from_millis(0),
            "heartbeat interval cannot be 0"
        );
        Heartbeat {
            last: now,
            interval,
        }
    }

    fn record_activity(&mut self, now: Instant) {
        self.last = now;
    }

    // A few ms of fudge so imprecise wakeups still count as expired; AMQP heartbeats are
    // scaled in seconds.
    fn check(&self, now: Instant) -> HeartbeatState {
        let elapsed = now.saturating_duration_since(self.last);
        if self.interval <= elapsed + Duration::from_millis(5) {
            HeartbeatState::Expired
        } else {
            HeartbeatState::StillRunning
        }
    }
}

/// Tracks rx/tx activity against the negotiated heartbeat interval.
#[derive(Debug, Default)]
pub(crate) struct HeartbeatTimers {
    heartbeats: Option<(Heartbeat, Heartbeat)>,
}

impl HeartbeatTimers {
    pub(crate) fn start(&mut self, interval: Duration, now: Instant) {
        assert!(
            self.heartbeats.is_none(),
            "heartbeat timer started multiple times"
        );
        let rx = Heartbeat::start(MAX_MISSED_SERVER_HEARTBEATS * interval, now);
        let tx = Heartbeat::start(interval, now);
        self.heartbeats = Some((rx, tx));
    }

    pub(crate) fn record_rx_activity(&mut self, now: Instant) {
        if let Some((rx, _)) = &mut self.heartbeats {
            trace!("recording activity for rx heartbeat");
            rx.record_activity(now);
        }
    }

    pub(crate) fn record_tx_activity(&mut self, now: Instant) {
        if let Some((_, tx)) = &mut self.heartbeats {
            trace!("recording activity for tx heartbeat");
            tx.record_activity(now);
        }
    }

    /// Expired once the server has been silent for two intervals.
    pub(crate) fn check_rx(&self, now: Instant) -> HeartbeatState {
        match &self.heartbeats {
            Some((rx, _)) => rx.check(now),
            None => HeartbeatState::StillRunning,
        }
    }

    /// Expired once we have sent nothing for one interval.
    pub(crate) fn check_tx(&self, now: Instant) -> HeartbeatState {
        match &self.heartbeats {
            Some((_, tx)) => tx.check(now),
            None => HeartbeatState::StillRunning,
        }
    }
}
