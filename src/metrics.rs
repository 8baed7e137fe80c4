use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SyncLabels {
    pub direction: SyncDirection,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum SyncDirection {
    WorkdirToBare,
    BareToWorkdir,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BuildLabels {
    pub outcome: BuildOutcomeLabel,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum BuildOutcomeLabel {
    Success,
    Failure,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the server.
pub struct Metrics {
    pub registry: Registry,

    // -- transport --
    pub fetch_total: Counter,
    pub push_total: Counter,
    pub auth_denied_total: Counter,

    // -- sync --
    pub sync_total: Family<SyncLabels, Counter>,

    // -- build --
    pub build_total: Family<BuildLabels, Counter>,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let fetch_total = Counter::default();
        registry.register(
            "forgebench_fetch",
            "git fetch/clone requests served",
            fetch_total.clone(),
        );

        let push_total = Counter::default();
        registry.register(
            "forgebench_push",
            "git push requests accepted",
            push_total.clone(),
        );

        let auth_denied_total = Counter::default();
        registry.register(
            "forgebench_auth_denied",
            "requests denied by token validation",
            auth_denied_total.clone(),
        );

        let sync_total = Family::<SyncLabels, Counter>::default();
        registry.register(
            "forgebench_sync_passes",
            "completed synchronization passes by direction",
            sync_total.clone(),
        );

        let build_total = Family::<BuildLabels, Counter>::default();
        registry.register(
            "forgebench_builds",
            "build pipeline runs by outcome",
            build_total.clone(),
        );

        Self {
            registry,
            fetch_total,
            push_total,
            auth_denied_total,
            sync_total,
            build_total,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_encode_as_text() {
        let metrics = Metrics::new();
        metrics.fetch_total.inc();
        metrics
            .sync_total
            .get_or_create(&SyncLabels {
                direction: SyncDirection::WorkdirToBare,
            })
            .inc();

        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &metrics.registry).unwrap();
        assert!(buf.contains("forgebench_fetch_total 1"));
        assert!(buf.contains("forgebench_sync_passes_total"));
        assert!(buf.contains("WorkdirToBare"));
    }
}
