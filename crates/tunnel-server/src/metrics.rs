//! Metrics collection and export

use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

/// Service label attached to every tunnel metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    V2,
    V3,
    Stun,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::V2 => "v2",
            Service::V3 => "v3",
            Service::Stun => "stun",
        }
    }
}

/// Server-wide counters and gauges, labelled by service
pub struct ServerMetrics {
    datagrams_received: IntCounterVec,
    datagrams_forwarded: IntCounterVec,
    bytes_forwarded: IntCounterVec,
    replies_sent: IntCounterVec,
    datagrams_dropped: IntCounterVec,
    admissions: IntCounterVec,
    evictions: IntCounterVec,
    live_clients: IntGaugeVec,
    maintenance: IntGaugeVec,
    registry: Registry,
}

impl ServerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let datagrams_received = IntCounterVec::new(
            Opts::new("tunnel_datagrams_received_total", "Datagrams read from the socket"),
            &["service"],
        )?;
        registry.register(Box::new(datagrams_received.clone()))?;

        let datagrams_forwarded = IntCounterVec::new(
            Opts::new("tunnel_datagrams_forwarded_total", "Datagrams relayed to a receiver"),
            &["service"],
        )?;
        registry.register(Box::new(datagrams_forwarded.clone()))?;

        let bytes_forwarded = IntCounterVec::new(
            Opts::new("tunnel_bytes_forwarded_total", "Bytes relayed to receivers"),
            &["service"],
        )?;
        registry.register(Box::new(bytes_forwarded.clone()))?;

        let replies_sent = IntCounterVec::new(
            Opts::new("tunnel_replies_total", "Ping and NAT discovery replies sent"),
            &["service"],
        )?;
        registry.register(Box::new(replies_sent.clone()))?;

        let datagrams_dropped = IntCounterVec::new(
            Opts::new("tunnel_datagrams_dropped_total", "Datagrams dropped, by reason"),
            &["service", "reason"],
        )?;
        registry.register(Box::new(datagrams_dropped.clone()))?;

        let admissions = IntCounterVec::new(
            Opts::new("tunnel_admissions_total", "Clients admitted or bound"),
            &["service"],
        )?;
        registry.register(Box::new(admissions.clone()))?;

        let evictions = IntCounterVec::new(
            Opts::new("tunnel_evictions_total", "Clients removed after timing out"),
            &["service"],
        )?;
        registry.register(Box::new(evictions.clone()))?;

        let live_clients = IntGaugeVec::new(
            Opts::new("tunnel_live_clients", "Registered clients after the last sweep"),
            &["service"],
        )?;
        registry.register(Box::new(live_clients.clone()))?;

        let maintenance = IntGaugeVec::new(
            Opts::new("tunnel_maintenance_mode", "1 while maintenance mode is on"),
            &["service"],
        )?;
        registry.register(Box::new(maintenance.clone()))?;

        Ok(Self {
            datagrams_received,
            datagrams_forwarded,
            bytes_forwarded,
            replies_sent,
            datagrams_dropped,
            admissions,
            evictions,
            live_clients,
            maintenance,
            registry,
        })
    }

    pub fn record_received(&self, service: Service) {
        self.datagrams_received.with_label_values(&[service.as_str()]).inc();
    }

    pub fn record_forward(&self, service: Service, bytes: usize) {
        let label = [service.as_str()];
        self.datagrams_forwarded.with_label_values(&label).inc();
        self.bytes_forwarded.with_label_values(&label).inc_by(bytes as u64);
    }

    pub fn record_reply(&self, service: Service) {
        self.replies_sent.with_label_values(&[service.as_str()]).inc();
    }

    pub fn record_drop(&self, service: Service, reason: &str) {
        self.datagrams_dropped
            .with_label_values(&[service.as_str(), reason])
            .inc();
    }

    pub fn record_admission(&self, service: Service) {
        self.admissions.with_label_values(&[service.as_str()]).inc();
    }

    pub fn record_evictions(&self, service: Service, count: usize) {
        self.evictions
            .with_label_values(&[service.as_str()])
            .inc_by(count as u64);
    }

    pub fn set_live_clients(&self, service: Service, count: usize) {
        self.live_clients
            .with_label_values(&[service.as_str()])
            .set(count as i64);
    }

    pub fn set_maintenance(&self, service: Service, enabled: bool) {
        self.maintenance
            .with_label_values(&[service.as_str()])
            .set(i64::from(enabled));
    }

    pub fn forwarded(&self, service: Service) -> u64 {
        self.datagrams_forwarded.with_label_values(&[service.as_str()]).get()
    }

    pub fn dropped(&self, service: Service, reason: &str) -> u64 {
        self.datagrams_dropped
            .with_label_values(&[service.as_str(), reason])
            .get()
    }

    /// Export Prometheus text format
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_labelled_by_service() {
        let metrics = ServerMetrics::new().unwrap();

        metrics.record_forward(Service::V3, 100);
        metrics.record_forward(Service::V3, 20);
        metrics.record_drop(Service::V2, "unknown_sender");

        assert_eq!(metrics.forwarded(Service::V3), 2);
        assert_eq!(metrics.forwarded(Service::V2), 0);
        assert_eq!(metrics.dropped(Service::V2, "unknown_sender"), 1);
    }

    #[test]
    fn test_export_contains_metric_names() {
        let metrics = ServerMetrics::new().unwrap();
        metrics.record_received(Service::Stun);
        metrics.set_live_clients(Service::V3, 4);
        metrics.set_maintenance(Service::V3, true);

        let text = metrics.export().unwrap();
        assert!(text.contains("tunnel_datagrams_received_total{service=\"stun\"} 1"));
        assert!(text.contains("tunnel_live_clients{service=\"v3\"} 4"));
        assert!(text.contains("tunnel_maintenance_mode{service=\"v3\"} 1"));
    }
}
