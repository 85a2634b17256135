// Metrics for observing a replication node
// Counters are recorded by strand-core itself; this module describes them,
// exports them and samples the cluster state into gauges

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

use strand_core::service::counters::{CHANGE_DURATION_METRIC, Counter};
use strand_core::{ClusterContext, Configuration};

use crate::startup::ShutdownSignal;

const MEMBERS_METRIC: &str = "strand_cluster_members";
const COMMITTED_METRIC: &str = "strand_committed_change_id";
const STATUS_METRIC: &str = "strand_node_status";

/// Initialize all metric descriptions
/// Should be called once at application startup
pub fn init_metrics() {
    for counter in Counter::ALL {
        describe_counter!(counter.metric_name(), counter.description());
    }
    describe_histogram!(
        CHANGE_DURATION_METRIC,
        "Time from creating a change to committing it, in seconds"
    );
    describe_gauge!(MEMBERS_METRIC, "Cluster members by state");
    describe_gauge!(COMMITTED_METRIC, "Highest change id committed by this node");
    describe_gauge!(STATUS_METRIC, "Rank of this node's status, 0 is offline");

    tracing::info!("Metrics initialized");
}

/// Serve `/metrics` on the configured port when enabled
pub fn install_exporter(configuration: &Configuration) -> anyhow::Result<()> {
    if !configuration.metrics_enabled() {
        return Ok(());
    }
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, configuration.metrics_port()));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("failed to start metrics exporter on {}: {}", addr, e))?;
    tracing::info!("Prometheus metrics exporter listening on {}", addr);
    Ok(())
}

/// Update the cluster gauges from the current state of `ctx`
pub fn record_cluster_state(ctx: &ClusterContext) {
    let summary = ctx.health_summary();
    gauge!(MEMBERS_METRIC, "state" => "total").set(summary.total as f64);
    gauge!(MEMBERS_METRIC, "state" => "reachable").set(summary.reachable as f64);
    gauge!(MEMBERS_METRIC, "state" => "ready").set(summary.ready as f64);
    gauge!(MEMBERS_METRIC, "state" => "synchronizing").set(summary.synchronizing as f64);
    gauge!(MEMBERS_METRIC, "state" => "away").set(summary.away as f64);
    gauge!(MEMBERS_METRIC, "state" => "offline").set(summary.offline as f64);

    gauge!(COMMITTED_METRIC).set(ctx.committed_id() as f64);
    gauge!(STATUS_METRIC).set(ctx.status() as u8 as f64);
}

/// Sample the cluster gauges every `interval` until shutdown
pub fn spawn_sampler(
    ctx: Arc<ClusterContext>,
    interval: Duration,
    shutdown: ShutdownSignal,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => record_cluster_state(&ctx),
                _ = shutdown.wait() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exporter_disabled_by_default() {
        let configuration = Configuration::default();
        assert!(!configuration.metrics_enabled());
        assert!(install_exporter(&configuration).is_ok());
    }

    #[test]
    fn test_counter_metric_names_are_unique() {
        let mut names: Vec<_> = Counter::ALL.iter().map(|c| c.metric_name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), Counter::ALL.len());
        assert!(!names.contains(&MEMBERS_METRIC));
    }
}
