//! Server statistics counters and their MessagePack reply body.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Snapshot returned by the ServerStatistics request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerStatistics {
    pub current_clients: u32,
    pub peak_clients: u32,
    pub total_registrations: u32,
    pub crashed_clients: u32,
    pub successful_transactions: u32,
    pub aborted_transactions: u32,
    pub open_transactions: u32,
    pub pending_requests: u32,
    pub outstanding_notifications: u32,
    pub total_requests: u64,
    pub total_notifications: u64,
    pub uptime_secs: u64,
}

/// Live counters kept by the server.
#[derive(Debug, Clone)]
pub(crate) struct StatsCounters {
    counters: ServerStatistics,
    started: Instant,
}

impl StatsCounters {
    pub(crate) fn new(started: Instant) -> Self {
        Self {
            counters: ServerStatistics::default(),
            started,
        }
    }

    pub(crate) fn snapshot(&self, now: Instant) -> ServerStatistics {
        ServerStatistics {
            uptime_secs: now.saturating_duration_since(self.started).as_secs(),
            ..self.counters.clone()
        }
    }

    pub(crate) fn client_registered(&mut self) {
        let c = &mut self.counters;
        c.current_clients += 1;
        c.total_registrations += 1;
        c.peak_clients = c.peak_clients.max(c.current_clients);
    }

    pub(crate) fn client_gone(&mut self, crashed: bool) {
        let c = &mut self.counters;
        c.current_clients = c.current_clients.saturating_sub(1);
        if crashed {
            c.crashed_clients += 1;
        }
    }

    pub(crate) fn request_arrived(&mut self) {
        self.counters.pending_requests += 1;
        self.counters.total_requests += 1;
    }

    pub(crate) fn reply_sent(&mut self) {
        self.counters.pending_requests = self.counters.pending_requests.saturating_sub(1);
    }

    pub(crate) fn notification_sent(&mut self, expects_response: bool) {
        self.counters.total_notifications += 1;
        if expects_response {
            self.counters.outstanding_notifications += 1;
        }
    }

    pub(crate) fn notifications_settled(&mut self, count: usize) {
        let n = u32::try_from(count).unwrap_or(u32::MAX);
        self.counters.outstanding_notifications =
            self.counters.outstanding_notifications.saturating_sub(n);
    }

    pub(crate) fn transaction_begun(&mut self) {
        self.counters.open_transactions += 1;
    }

    pub(crate) fn transaction_ended(&mut self, committed: bool) {
        let c = &mut self.counters;
        c.open_transactions = c.open_transactions.saturating_sub(1);
        if committed {
            c.successful_transactions += 1;
        } else {
            c.aborted_transactions += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgPackCodec;
    use std::time::Duration;

    #[test]
    fn test_client_counters() {
        let mut stats = StatsCounters::new(Instant::now());
        stats.client_registered();
        stats.client_registered();
        stats.client_gone(false);
        stats.client_gone(true);
        stats.client_registered();

        let snap = stats.snapshot(Instant::now());
        assert_eq!(snap.current_clients, 1);
        assert_eq!(snap.peak_clients, 2);
        assert_eq!(snap.total_registrations, 3);
        assert_eq!(snap.crashed_clients, 1);
    }

    #[test]
    fn test_transaction_and_notification_counters() {
        let mut stats = StatsCounters::new(Instant::now());
        stats.transaction_begun();
        stats.transaction_begun();
        stats.transaction_ended(true);
        stats.transaction_ended(false);
        stats.notification_sent(true);
        stats.notification_sent(false);
        stats.notifications_settled(5);

        let snap = stats.snapshot(Instant::now());
        assert_eq!(snap.open_transactions, 0);
        assert_eq!(snap.successful_transactions, 1);
        assert_eq!(snap.aborted_transactions, 1);
        assert_eq!(snap.total_notifications, 2);
        assert_eq!(snap.outstanding_notifications, 0);
    }

    #[test]
    fn test_uptime_and_encoding() {
        let started = Instant::now();
        let mut stats = StatsCounters::new(started);
        stats.request_arrived();

        let snap = stats.snapshot(started + Duration::from_secs(90));
        assert_eq!(snap.uptime_secs, 90);
        assert_eq!(snap.pending_requests, 1);

        let decoded: ServerStatistics =
            MsgPackCodec::decode(&MsgPackCodec::encode(&snap).unwrap()).unwrap();
        assert_eq!(decoded, snap);
    }
}
