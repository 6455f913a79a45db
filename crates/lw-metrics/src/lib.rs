use anyhow::Result;
use axum::{Router, routing::get};
use lw_core::{ChainEntry, Family, RuleEntry};
use prometheus::{Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use tracing::info;

/// Metrics collector for the lockwall daemon
pub struct MetricsCollector {
    registry: Registry,

    // Request metrics
    requests_total: IntCounterVec,

    // Store metrics
    chains: IntGaugeVec,
    rules: IntGaugeVec,

    // Lockdown
    lockdown_enabled: IntGauge,
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("lockwall_requests_total", "Handled requests by method and result"),
            &["method", "result"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let chains = IntGaugeVec::new(
            Opts::new("lockwall_chains", "Direct chains in the store"),
            &["family"],
        )?;
        registry.register(Box::new(chains.clone()))?;

        let rules = IntGaugeVec::new(
            Opts::new("lockwall_rules", "Direct rules in the store"),
            &["family"],
        )?;
        registry.register(Box::new(rules.clone()))?;

        let lockdown_enabled = IntGauge::new(
            "lockwall_lockdown_enabled",
            "Lockdown state (1=enabled, 0=disabled)",
        )?;
        registry.register(Box::new(lockdown_enabled.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            chains,
            rules,
            lockdown_enabled,
        })
    }

    /// `result` is "ok" or an error kind such as "NOT_ENABLED"
    pub fn record_request(&self, method: &str, result: &str) {
        self.requests_total.with_label_values(&[method, result]).inc();
    }

    /// Refresh per-family store gauges
    pub fn update_store(&self, chains: &[ChainEntry], rules: &[RuleEntry]) {
        for family in Family::ALL {
            let chain_count = chains.iter().filter(|c| c.ipv == family).count();
            let rule_count = rules.iter().filter(|r| r.ipv == family).count();
            self.chains
                .with_label_values(&[family.as_str()])
                .set(chain_count as i64);
            self.rules
                .with_label_values(&[family.as_str()])
                .set(rule_count as i64);
        }
    }

    pub fn set_lockdown(&self, enabled: bool) {
        self.lockdown_enabled.set(i64::from(enabled));
    }

    /// Render metrics in Prometheus text format
    pub fn render_metrics(&self) -> Result<String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// HTTP server for Prometheus metrics endpoint
pub struct MetricsServer {
    collector: Arc<MetricsCollector>,
    addr: std::net::SocketAddr,
}

impl MetricsServer {
    pub fn new(collector: Arc<MetricsCollector>, port: u16) -> Self {
        let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
        Self { collector, addr }
    }

    /// Start the metrics HTTP server
    pub async fn serve(self) -> Result<()> {
        let collector = self.collector.clone();

        let app = Router::new().route(
            "/metrics",
            get(move || {
                let collector = collector.clone();
                async move {
                    match collector.render_metrics() {
                        Ok(metrics) => metrics,
                        Err(e) => format!("# Error rendering metrics: {}", e),
                    }
                }
            }),
        );

        info!("metrics server listening on http://{}/metrics", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}
