pub mod a3c;
pub mod alphazero;
pub mod diffusion;
pub mod dqn;
pub mod dualhead;
pub mod genetic;
pub mod mctslite;
pub mod model;
pub mod policy;
pub mod qtable;
pub mod registry;
pub mod value;

pub use registry::Registry;

use crate::chess::Move;
use crate::chess::Position;
use crate::coordinator::StopToken;
use crate::save::Dirty;
use crate::selfplay::Driver;
use crate::selfplay::Outcome;
use crate::selfplay::Rollout;
use crate::selfplay::Trajectory;
use std::collections::BTreeMap;
use std::io::Read;
use std::io::Write;
use std::sync::Arc;

/// stable identifiers for the engine stable. tags go into checkpoint
/// headers and names into filenames, so both are frozen.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    QTable,
    Value,
    PolicyCnn,
    Dqn,
    AlphaZero,
    MctsLite,
    DualHead,
    A3c,
    Diffusion,
    Genetic,
}

impl Kind {
    pub const ALL: [Self; 10] = [
        Self::QTable,
        Self::Value,
        Self::PolicyCnn,
        Self::Dqn,
        Self::AlphaZero,
        Self::MctsLite,
        Self::DualHead,
        Self::A3c,
        Self::Diffusion,
        Self::Genetic,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::QTable => "qtable",
            Self::Value => "value",
            Self::PolicyCnn => "policy_cnn",
            Self::Dqn => "dqn",
            Self::AlphaZero => "alphazero",
            Self::MctsLite => "mcts_lite",
            Self::DualHead => "dual_head",
            Self::A3c => "a3c",
            Self::Diffusion => "diffusion",
            Self::Genetic => "genetic",
        }
    }

    /// checkpoint header tag
    pub fn tag(&self) -> u16 {
        match self {
            Self::QTable => 1,
            Self::Value => 2,
            Self::PolicyCnn => 3,
            Self::Dqn => 4,
            Self::AlphaZero => 5,
            Self::MctsLite => 6,
            Self::DualHead => 7,
            Self::A3c => 8,
            Self::Diffusion => 9,
            Self::Genetic => 10,
        }
    }

    pub fn from_tag(tag: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.tag() == tag)
    }

    /// the files this learner owns under the state directory. the first
    /// is the primary artifact.
    pub fn files(&self) -> &'static [&'static str] {
        match self {
            Self::QTable => &["qtable.dat"],
            Self::Value => &["value_model.zip"],
            Self::PolicyCnn => &["policy_cnn.zip"],
            Self::Dqn => &["dqn_main.zip", "dqn_target.zip", "dqn_experiences.dat"],
            Self::AlphaZero => &["alphazero_cache.dat"],
            Self::MctsLite => &["mcts_lite.dat"],
            Self::DualHead => &["leela_policy.zip", "leela_value.zip"],
            Self::A3c => &["a3c_actor.zip", "a3c_critic.zip", "a3c_state.dat"],
            Self::Diffusion => &["diffusion_state.dat"],
            Self::Genetic => &["genetic.dat"],
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Kind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| format!("unknown learner kind: {}", s))
    }
}

/// named gauges a learner reports: episodes, steps, buffer size,
/// average reward, and whatever else the kind finds interesting.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Metrics(pub BTreeMap<String, f64>);

impl Metrics {
    pub fn set(&mut self, key: &str, value: f64) -> &mut Self {
        self.0.insert(key.to_string(), value);
        self
    }
    pub fn get(&self, key: &str) -> f64 {
        self.0.get(key).copied().unwrap_or(0.)
    }
    pub fn episodes(&self) -> u64 {
        self.get("episodes") as u64
    }
}

/// counters every learner carries. episodes are monotonically
/// non-decreasing over a process lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Progress {
    pub episodes: u64,
    pub steps: u64,
    pub reward_sum: f64,
}

impl Progress {
    pub fn absorb(&mut self, trajectory: &Trajectory) {
        self.episodes += 1;
        self.steps += trajectory.len() as u64;
        self.reward_sum += trajectory.reward() as f64;
    }
    pub fn metrics(&self) -> Metrics {
        let mut metrics = Metrics::default();
        metrics
            .set("episodes", self.episodes as f64)
            .set("steps", self.steps as f64)
            .set(
                "reward_avg",
                match self.episodes {
                    0 => 0.,
                    n => self.reward_sum / n as f64,
                },
            );
        metrics
    }
    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use byteorder::BE;
        use byteorder::WriteBytesExt;
        w.write_u64::<BE>(self.episodes)?;
        w.write_u64::<BE>(self.steps)?;
        w.write_f64::<BE>(self.reward_sum)?;
        Ok(())
    }
    pub fn read(r: &mut dyn Read) -> std::io::Result<Self> {
        use byteorder::BE;
        use byteorder::ReadBytesExt;
        Ok(Self {
            episodes: r.read_u64::<BE>()?,
            steps: r.read_u64::<BE>()?,
            reward_sum: r.read_f64::<BE>()?,
        })
    }
}

/// everything a training worker gets handed: the episode budget, the
/// shared stop token, the shared self-play driver, and the dirty table
/// to flag state worth persisting.
#[derive(Clone)]
pub struct Session {
    pub budget: u64,
    pub max_plies: usize,
    pub stop: StopToken,
    pub driver: Arc<Driver>,
    pub dirty: Dirty,
}

impl Session {
    pub fn new(budget: u64, stop: StopToken, driver: Arc<Driver>, dirty: Dirty) -> Self {
        Self {
            budget,
            max_plies: crate::MAX_PLIES,
            stop,
            driver,
            dirty,
        }
    }
}

/// the capability set every engine satisfies. the coordinator and the
/// dispatcher speak only this contract and never touch model bytes.
pub trait Learner: Rollout + Send {
    fn kind(&self) -> Kind;

    /// propose a move. None concedes the turn to the dispatcher's
    /// fallback path.
    fn choose(&mut self, position: &Position, legal: &[Move], training: bool) -> Option<Move>;

    /// blocking training loop. returns at the episode budget or
    /// promptly after the session's stop token flips.
    fn train(&mut self, session: &Session);

    /// how many episodes the coordinator should hand this learner per
    /// lock acquisition. learners with expensive setup ask for more.
    fn stride(&self) -> u64 {
        1
    }

    /// extra cooperative teardown past the stop token, for learners
    /// with internal machinery of their own
    fn halt(&mut self) {}

    /// optional ingestion of a game played by a human
    fn absorb(&mut self, trajectory: &Trajectory, outcome: Outcome) {
        let _ = (trajectory, outcome);
    }

    /// serialize one of `kind().files()` into the writer. save and
    /// load form a bijection on the learner's state.
    fn save(&self, file: &str, w: &mut dyn Write) -> std::io::Result<()>;
    fn load(&mut self, file: &str, r: &mut dyn Read) -> std::io::Result<()>;

    fn metrics(&self) -> Metrics;

    /// internally-consistent serialized view of every file, detached
    /// from subsequent mutation. the periodic saver's only read.
    fn snapshot(&self) -> std::io::Result<Vec<(&'static str, Vec<u8>)>> {
        let mut parts = Vec::new();
        for file in self.kind().files() {
            let mut buffer = Vec::new();
            self.save(file, &mut buffer)?;
            parts.push((*file, buffer));
        }
        Ok(parts)
    }
}

/// a learner as the coordinator and the dispatcher share it: the worker
/// holds the lock for one training chunk at a time, everyone else for
/// one call
pub type SharedLearner = Arc<std::sync::Mutex<Box<dyn Learner>>>;

/// unknown file name handed to save or load
pub(crate) fn unknown_file(kind: Kind, file: &str) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        format!("{} owns no file named {}", kind, file),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_unique_and_stable() {
        let mut tags = Kind::ALL.iter().map(|k| k.tag()).collect::<Vec<_>>();
        tags.sort_unstable();
        tags.dedup();
        assert!(tags.len() == Kind::ALL.len());
        for kind in Kind::ALL {
            assert!(Kind::from_tag(kind.tag()) == Some(kind));
        }
    }

    #[test]
    fn names_parse_back() {
        for kind in Kind::ALL {
            assert!(kind.name().parse::<Kind>() == Ok(kind));
        }
    }

    #[test]
    fn every_kind_owns_at_least_one_file() {
        for kind in Kind::ALL {
            assert!(!kind.files().is_empty());
        }
    }

    #[test]
    fn progress_roundtrips() {
        let progress = Progress {
            episodes: 7,
            steps: 941,
            reward_sum: -3.25,
        };
        let mut buffer = Vec::new();
        progress.write(&mut buffer).expect("write");
        let ref mut reader = buffer.as_slice();
        assert!(Progress::read(reader).expect("read") == progress);
    }
}
