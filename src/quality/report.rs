use crate::coordinator::Coordinator;
use crate::learner::Kind;
use crate::learner::Metrics;
use crate::save::Vault;
use std::collections::BTreeMap;

/// one learner's offline assessment: its live gauges, its file
/// footprint, and a score in [0, 100].
#[derive(Debug, Clone, serde::Serialize)]
pub struct Assessment {
    pub metrics: Metrics,
    pub checkpoint_bytes: u64,
    pub checkpoint_age_seconds: Option<u64>,
    pub score: f64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QualityReport(pub BTreeMap<Kind, Assessment>);

/// offline evaluator over checkpoints and live counters. strictly
/// read-only: it mutates nothing and triggers no saves.
pub struct Reporter;

impl Reporter {
    pub fn assess(coordinator: &Coordinator, vault: &Vault) -> QualityReport {
        let mut report = QualityReport::default();
        for (kind, metrics) in coordinator.metrics() {
            let (bytes, age) = Self::footprint(vault, kind);
            let score = Self::score(&metrics, bytes, age);
            report.0.insert(
                kind,
                Assessment {
                    metrics,
                    checkpoint_bytes: bytes,
                    checkpoint_age_seconds: age,
                    score,
                },
            );
        }
        report
    }

    /// total size and freshest age across the learner's files
    fn footprint(vault: &Vault, kind: Kind) -> (u64, Option<u64>) {
        let mut bytes = 0;
        let mut age = None;
        for file in kind.files() {
            let Ok(stat) = std::fs::metadata(vault.path(file)) else {
                continue;
            };
            bytes += stat.len();
            let seconds = stat
                .modified()
                .ok()
                .and_then(|t| t.elapsed().ok())
                .map(|d| d.as_secs());
            age = match (age, seconds) {
                (None, s) => s,
                (Some(a), Some(s)) => Some(a.min(s)),
                (a, None) => a,
            };
        }
        (bytes, age)
    }

    /// experience, persistence, reward trend, and availability folded
    /// into a single comparable number
    fn score(metrics: &Metrics, bytes: u64, age: Option<u64>) -> f64 {
        let mut score = 0.;
        // up to 40 for experience, log-scaled against a long run
        let episodes = metrics.get("episodes");
        score += 40. * ((1. + episodes).log10() / 5.).min(1.);
        // up to 20 for having durable state at all
        if bytes > 0 {
            score += 10.;
            if age.is_some_and(|a| a < 2 * crate::PERIODIC_SAVE_MINUTES * 60) {
                score += 10.;
            }
        }
        // up to 30 for reward trend, mapped from [-1, 1]
        let reward = metrics.get("reward_avg").clamp(-1., 1.);
        score += 15. * (reward + 1.);
        // the rest for availability
        if metrics.get("degraded") == 0. {
            score += 10.;
        }
        score.clamp(0., 100.)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::learner::Registry;
    use crate::selfplay::Driver;
    use std::sync::Arc;

    fn runtime(dir: &std::path::Path, kinds: &[Kind]) -> (Coordinator, Arc<Vault>) {
        let mut config = Config::default();
        config.enabled = kinds.to_vec();
        config.state_dir = dir.to_path_buf();
        let vault = Arc::new(Vault::new(dir, false).expect("vault"));
        let learners = Registry::stable(&config, &vault);
        let coordinator = Coordinator::new(&config, learners, vault.clone(), Arc::new(Driver::new()));
        (coordinator, vault)
    }

    #[test]
    fn scores_stay_in_range() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (coordinator, vault) = runtime(dir.path(), &[Kind::QTable, Kind::Value]);
        let report = Reporter::assess(&coordinator, &vault);
        assert!(report.0.len() == 2);
        for assessment in report.0.values() {
            assert!((0. ..=100.).contains(&assessment.score));
        }
    }

    #[test]
    fn assessment_mutates_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (coordinator, vault) = runtime(dir.path(), &[Kind::QTable]);
        let before = coordinator.metrics();
        let _ = Reporter::assess(&coordinator, &vault);
        let after = coordinator.metrics();
        assert!(before[&Kind::QTable].episodes() == after[&Kind::QTable].episodes());
        // no saves were triggered
        assert!(std::fs::read_dir(dir.path()).expect("read dir").count() == 0);
        assert!(vault.dirty().is_clean());
    }

    #[test]
    fn durable_experienced_learners_outscore_fresh_ones() {
        let fresh = Metrics::default();
        let mut seasoned = Metrics::default();
        seasoned.set("episodes", 10_000.);
        seasoned.set("reward_avg", 0.2);
        let low = Reporter::score(&fresh, 0, None);
        let high = Reporter::score(&seasoned, 1 << 20, Some(60));
        assert!(high > low);
    }
}
