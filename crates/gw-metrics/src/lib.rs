use anyhow::Result;
use axum::{Router, routing::get};
use gw_alloc::{IpPool, MarkAllocator};
use prometheus::{Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Metrics collector for the gateway control plane
pub struct MetricsCollector {
    registry: Arc<Registry>,

    // Allocator metrics
    marks_in_use: IntGauge,
    mark_capacity: IntGauge,
    pool_in_use: IntGaugeVec,
    pool_capacity: IntGaugeVec,

    // Policy metrics
    policy_rejections: IntCounterVec,
    table_rules: IntGaugeVec,
    rule_writes: IntCounterVec,
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let marks_in_use = IntGauge::new("gwarden_marks_in_use", "Connection marks bound to an owner")?;
        registry.register(Box::new(marks_in_use.clone()))?;

        let mark_capacity = IntGauge::new(
            "gwarden_mark_capacity",
            "Highest mark the allocator may hand out",
        )?;
        registry.register(Box::new(mark_capacity.clone()))?;

        let pool_in_use = IntGaugeVec::new(
            Opts::new(
                "gwarden_pool_addresses_in_use",
                "Reserved addresses per pool",
            ),
            &["pool"],
        )?;
        registry.register(Box::new(pool_in_use.clone()))?;

        let pool_capacity = IntGaugeVec::new(
            Opts::new("gwarden_pool_capacity", "Assignable addresses per pool"),
            &["pool"],
        )?;
        registry.register(Box::new(pool_capacity.clone()))?;

        let policy_rejections = IntCounterVec::new(
            Opts::new(
                "gwarden_policy_rejections_total",
                "Firewall configurations rejected at validation",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(policy_rejections.clone()))?;

        let table_rules = IntGaugeVec::new(
            Opts::new("gwarden_table_rules", "Compiled rules per managed table"),
            &["family", "table"],
        )?;
        registry.register(Box::new(table_rules.clone()))?;

        let rule_writes = IntCounterVec::new(
            Opts::new(
                "gwarden_rule_writes_total",
                "Rule writes issued to the kernel",
            ),
            &["op"],
        )?;
        registry.register(Box::new(rule_writes.clone()))?;

        Ok(Self {
            registry,
            marks_in_use,
            mark_capacity,
            pool_in_use,
            pool_capacity,
            policy_rejections,
            table_rules,
            rule_writes,
        })
    }

    /// Update mark allocator gauges
    pub fn update_mark_metrics(&self, marks: &MarkAllocator) {
        self.marks_in_use.set(marks.in_use_count() as i64);
        self.mark_capacity.set(i64::from(marks.max()));
    }

    /// Update per-pool gauges
    pub fn update_pool_metrics(&self, pools: &[Arc<IpPool>]) {
        for pool in pools {
            self.pool_in_use
                .with_label_values(&[pool.name()])
                .set(pool.in_use() as i64);
            self.pool_capacity
                .with_label_values(&[pool.name()])
                .set(i64::try_from(pool.capacity()).unwrap_or(i64::MAX));
        }
    }

    pub fn set_table_rules(&self, family: &str, table: &str, rules: usize) {
        self.table_rules
            .with_label_values(&[family, table])
            .set(rules as i64);
    }

    /// Record a rejected configuration
    pub fn record_rejection(&self, reason: &str) {
        self.policy_rejections.with_label_values(&[reason]).inc();
    }

    /// Record rule writes by operation (add, replace, delete)
    pub fn record_rule_writes(&self, op: &str, count: u64) {
        self.rule_writes.with_label_values(&[op]).inc_by(count);
    }

    /// Get the registry for HTTP server
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
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
    collector: Arc<RwLock<MetricsCollector>>,
    addr: std::net::SocketAddr,
}

impl MetricsServer {
    pub fn new(collector: MetricsCollector, port: u16) -> Self {
        let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
        Self {
            collector: Arc::new(RwLock::new(collector)),
            addr,
        }
    }

    /// Shared handle so callers can keep updating gauges while serving
    pub fn collector(&self) -> Arc<RwLock<MetricsCollector>> {
        self.collector.clone()
    }

    /// Start the metrics HTTP server
    pub async fn serve(self) -> Result<()> {
        let collector = self.collector.clone();

        let app = Router::new().route(
            "/metrics",
            get(move || {
                let collector = collector.clone();
                async move {
                    let collector = collector.read().await;
                    match collector.render_metrics() {
                        Ok(metrics) => metrics,
                        Err(e) => format!("# Error rendering metrics: {}", e),
                    }
                }
            }),
        );

        info!(addr = %self.addr, "Metrics server listening");
        println!("📊 Metrics server listening on http://{}/metrics", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collector_creation() {
        let collector = MetricsCollector::new();
        assert!(collector.is_ok());
    }

    #[test]
    fn test_allocator_metrics() {
        let collector = MetricsCollector::new().unwrap();

        let marks = MarkAllocator::new(16);
        let _ = marks.start_transaction("remote-a").unwrap().commit();
        collector.update_mark_metrics(&marks);

        let pool = Arc::new(IpPool::new("fabric", "10.80.0.0/30".parse().unwrap()));
        pool.allocate("remote-a").unwrap();
        collector.update_pool_metrics(&[pool]);

        let output = collector.render_metrics().unwrap();
        assert!(output.contains("gwarden_marks_in_use 1"));
        assert!(output.contains("gwarden_mark_capacity 16"));
        assert!(output.contains("gwarden_pool_addresses_in_use{pool=\"fabric\"} 1"));
        assert!(output.contains("gwarden_pool_capacity{pool=\"fabric\"} 2"));
    }

    #[test]
    fn test_policy_counters() {
        let collector = MetricsCollector::new().unwrap();
        collector.record_rejection("hook_not_allowed");
        collector.record_rejection("hook_not_allowed");
        collector.record_rule_writes("add", 3);
        collector.set_table_rules("inet", "remote-a", 3);

        let output = collector.render_metrics().unwrap();
        assert!(output.contains("gwarden_policy_rejections_total{reason=\"hook_not_allowed\"} 2"));
        assert!(output.contains("gwarden_rule_writes_total{op=\"add\"} 3"));
        assert!(output.contains("gwarden_table_rules{family=\"inet\",table=\"remote-a\"} 3"));
    }
}
