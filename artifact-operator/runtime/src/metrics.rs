use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PhaseLabels {
    pub phase: String,
}

/// The two process-wide gauges the controller maintains. Handles are cheap
/// clones sharing the underlying metrics, so the reconciler context can carry
/// one without touching a global registry.
#[derive(Clone, Default)]
pub struct ControllerMetrics {
    artifacts: Gauge,
    artifacts_by_phase: Family<PhaseLabels, Gauge>,
}

impl ControllerMetrics {
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "kyverno_artifacts",
            "Total number of KyvernoArtifact resources being managed",
            metrics.artifacts.clone(),
        );
        registry.register(
            "kyverno_artifacts_by_phase",
            "Number of KyvernoArtifact resources by worker pod phase",
            metrics.artifacts_by_phase.clone(),
        );
        metrics
    }

    pub fn set_total(&self, count: i64) {
        self.artifacts.set(count);
    }

    /// Drops every phase bucket; called before re-emitting so phases no
    /// longer present read as absent rather than stale.
    pub fn reset_phases(&self) {
        self.artifacts_by_phase.clear();
    }

    pub fn set_phase(&self, phase: &str, count: i64) {
        self.artifacts_by_phase
            .get_or_create(&PhaseLabels {
                phase: phase.to_string(),
            })
            .set(count);
    }

    pub fn total(&self) -> i64 {
        self.artifacts.get()
    }

    pub fn phase(&self, phase: &str) -> i64 {
        self.artifacts_by_phase
            .get_or_create(&PhaseLabels {
                phase: phase.to_string(),
            })
            .get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauges_are_observable_through_the_handle() {
        let metrics = ControllerMetrics::default();
        metrics.set_total(3);
        metrics.set_phase("Running", 2);
        metrics.set_phase("Unknown", 1);
        assert_eq!(metrics.total(), 3);
        assert_eq!(metrics.phase("Running"), 2);
        assert_eq!(metrics.phase("Unknown"), 1);
    }

    #[test]
    fn clones_share_state() {
        let metrics = ControllerMetrics::default();
        let clone = metrics.clone();
        metrics.set_total(7);
        assert_eq!(clone.total(), 7);
    }

    #[test]
    fn reset_clears_phase_buckets() {
        let metrics = ControllerMetrics::default();
        metrics.set_phase("Running", 5);
        metrics.reset_phases();
        assert_eq!(metrics.phase("Running"), 0);
    }

    #[test]
    fn registration_returns_a_live_handle() {
        let mut registry = Registry::default();
        let metrics = ControllerMetrics::register(&mut registry);
        metrics.set_total(1);
        assert_eq!(metrics.total(), 1);
    }
}
