use super::Kind;
use super::Learner;
use super::a3c::A3c;
use super::alphazero::AlphaZero;
use super::diffusion::Diffusion;
use super::dqn::Dqn;
use super::dualhead::DualHead;
use super::genetic::Genetic;
use super::mctslite::MctsLite;
use super::policy::PolicyCnn;
use super::qtable::QTable;
use super::value::Value;
use crate::config::Config;
use crate::save::SaveError;
use crate::save::Vault;

/// maps kinds to factories and rebuilds the enabled stable at startup.
/// the set of learners is fixed for the process lifetime after this.
pub struct Registry;

impl Registry {
    pub fn create(kind: Kind, config: &Config) -> Box<dyn Learner> {
        match kind {
            Kind::QTable => Box::new(QTable::new()),
            Kind::Value => Box::new(Value::new()),
            Kind::PolicyCnn => Box::new(PolicyCnn::new()),
            Kind::Dqn => Box::new(Dqn::new(config.replay_capacity)),
            Kind::AlphaZero => Box::new(AlphaZero::new()),
            Kind::MctsLite => Box::new(MctsLite::new()),
            Kind::DualHead => Box::new(DualHead::new()),
            Kind::A3c => Box::new(A3c::new(config.a3c_workers, config.a3c_sync_frequency)),
            Kind::Diffusion => Box::new(Diffusion::new()),
            Kind::Genetic => Box::new(Genetic::new()),
        }
    }

    /// instantiate every enabled learner and restore whatever state the
    /// vault holds for it. duplicate kinds were rejected at config
    /// validation.
    pub fn stable(config: &Config, vault: &Vault) -> Vec<Box<dyn Learner>> {
        config
            .enabled
            .iter()
            .map(|kind| {
                let mut learner = Self::create(*kind, config);
                if !Self::restore(learner.as_mut(), vault) {
                    // a half-applied load leaves no trustworthy state
                    learner = Self::create(*kind, config);
                }
                learner
            })
            .collect()
    }

    /// best effort: a missing, corrupt, or incompatible file leaves the
    /// learner fresh for that part and the process keeps going. returns
    /// false when a body failed mid-load and the caller should rebuild.
    pub fn restore(learner: &mut dyn Learner, vault: &Vault) -> bool {
        let kind = learner.kind();
        let mut clean = true;
        for file in kind.files() {
            match vault.load(kind, file) {
                Ok(body) => match learner.load(file, &mut body.as_slice()) {
                    Ok(()) => log::info!("{} restored from {}", kind, file),
                    Err(e) => {
                        log::warn!("{} body unreadable ({}); starting fresh: {}", kind, file, e);
                        let _ = vault.condemn(file);
                        clean = false;
                    }
                },
                Err(SaveError::Missing) => {
                    log::debug!("{} has no checkpoint at {}", kind, file)
                }
                Err(SaveError::Corrupt(aside)) => {
                    log::warn!(
                        "{} checkpoint corrupt; quarantined at {} and starting fresh",
                        kind,
                        aside.display()
                    )
                }
                Err(SaveError::Incompatible { expected, found }) => {
                    log::warn!(
                        "{} checkpoint schema {} (want {}); starting fresh",
                        kind,
                        found,
                        expected
                    )
                }
                Err(e) => log::error!("{} checkpoint unreadable: {}", kind, e),
            }
        }
        clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_constructs_with_its_own_tag() {
        let config = Config::default();
        for kind in Kind::ALL {
            let learner = Registry::create(kind, &config);
            assert!(learner.kind() == kind);
        }
    }

    #[test]
    fn fresh_stable_reports_zero_episodes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vault = Vault::new(dir.path(), false).expect("vault");
        let config = Config::default();
        for learner in Registry::stable(&config, &vault) {
            assert!(learner.metrics().episodes() == 0);
        }
    }

    #[test]
    fn corrupt_state_quarantines_and_starts_fresh() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vault = Vault::new(dir.path(), false).expect("vault");
        std::fs::write(vault.path("qtable.dat"), b"not a checkpoint at all").expect("write");
        let config = Config::default();
        let mut learner = Registry::create(Kind::QTable, &config);
        Registry::restore(learner.as_mut(), &vault);
        assert!(learner.metrics().episodes() == 0);
        assert!(!vault.path("qtable.dat").exists());
    }
}
