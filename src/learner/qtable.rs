use super::Kind;
use super::Learner;
use super::Metrics;
use super::Progress;
use super::Session;
use crate::chess::Codec;
use crate::chess::Move;
use crate::chess::Position;
use crate::chess::Space;
use crate::selfplay::Outcome;
use crate::selfplay::Rollout;
use crate::selfplay::Trajectory;
use byteorder::BE;
use byteorder::ReadBytesExt;
use byteorder::WriteBytesExt;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::collections::BTreeMap;
use std::io::Read;
use std::io::Write;

const GAMMA: f32 = 0.95;
const EPSILON_START: f32 = 0.30;
const EPSILON_FLOOR: f32 = 0.05;
const ALPHA_START: f32 = 0.40;
const ALPHA_FLOOR: f32 = 0.02;

/// tabular Q-learning over canonical position keys, epsilon-greedy with
/// decayed exploration and learning rate.
pub struct QTable {
    table: BTreeMap<String, BTreeMap<u32, f32>>,
    progress: Progress,
    rng: SmallRng,
}

impl Default for QTable {
    fn default() -> Self {
        Self {
            table: BTreeMap::new(),
            progress: Progress::default(),
            rng: SmallRng::seed_from_u64(rand::rng().random()),
        }
    }
}

impl QTable {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn entries(&self) -> usize {
        self.table.len()
    }

    /// exploration decays with experience
    fn epsilon(&self) -> f32 {
        (EPSILON_START * 0.999f32.powi(self.progress.episodes as i32)).max(EPSILON_FLOOR)
    }
    fn alpha(&self) -> f32 {
        (ALPHA_START * 0.9995f32.powi(self.progress.episodes as i32)).max(ALPHA_FLOOR)
    }

    fn q(&self, key: &str, action: u32) -> f32 {
        self.table
            .get(key)
            .and_then(|actions| actions.get(&action))
            .copied()
            .unwrap_or(0.)
    }

    /// the side to move's best stored value at a position
    fn best(&self, key: &str) -> f32 {
        self.table
            .get(key)
            .map(|actions| actions.values().copied().fold(0f32, f32::max))
            .unwrap_or(0.)
    }

    fn greedy(&self, position: &Position, legal: &[Move]) -> Option<Move> {
        let key = Codec::hash(position);
        legal.iter().copied().max_by(|a, b| {
            let qa = self.q(&key, Codec::encode(Space::Simple, a));
            let qb = self.q(&key, Codec::encode(Space::Simple, b));
            qa.partial_cmp(&qb).unwrap_or(std::cmp::Ordering::Equal)
        })
    }

    /// one-step Q backup over the whole trajectory. the successor is the
    /// opponent's position, so their best is our loss.
    fn learn(&mut self, trajectory: &Trajectory) {
        let alpha = self.alpha();
        for step in trajectory.steps() {
            let key = Codec::hash(&step.before);
            let action = Codec::encode(Space::Simple, &step.m);
            let bootstrap = match step.terminal {
                true => 0.,
                false => -self.best(&Codec::hash(&step.after)),
            };
            let target = step.reward + GAMMA * bootstrap;
            let q = self.q(&key, action);
            self.table
                .entry(key)
                .or_default()
                .insert(action, q + alpha * (target - q));
        }
    }
}

impl Rollout for QTable {
    fn act(&mut self, position: &Position, legal: &[Move]) -> Move {
        self.choose(position, legal, true).unwrap_or(legal[0])
    }
}

impl Learner for QTable {
    fn kind(&self) -> Kind {
        Kind::QTable
    }

    fn choose(&mut self, position: &Position, legal: &[Move], training: bool) -> Option<Move> {
        use rand::seq::IndexedRandom;
        if legal.is_empty() {
            return None;
        }
        if training && self.rng.random::<f32>() < self.epsilon() {
            return legal.choose(&mut self.rng).copied();
        }
        self.greedy(position, legal)
    }

    fn train(&mut self, session: &Session) {
        let target = self.progress.episodes + session.budget;
        log::debug!("qtable training toward episode {}", target);
        while self.progress.episodes < target && !session.stop.stopped() {
            let trajectory = session
                .driver
                .run_episode(self, session.max_plies, &session.stop);
            if trajectory.is_empty() {
                continue;
            }
            self.learn(&trajectory);
            self.progress.absorb(&trajectory);
            session.dirty.mark(Kind::QTable);
        }
        log::debug!("qtable training idle at episode {}", self.progress.episodes);
    }

    fn absorb(&mut self, trajectory: &Trajectory, _: Outcome) {
        self.learn(trajectory);
        self.progress.absorb(trajectory);
    }

    /// gzip-compressed serialized map, plus the counters
    fn save(&self, file: &str, w: &mut dyn Write) -> std::io::Result<()> {
        if file != "qtable.dat" {
            return Err(super::unknown_file(self.kind(), file));
        }
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        self.progress.write(&mut encoder)?;
        encoder.write_u64::<BE>(self.table.len() as u64)?;
        for (key, actions) in &self.table {
            encoder.write_u16::<BE>(key.len() as u16)?;
            encoder.write_all(key.as_bytes())?;
            encoder.write_u16::<BE>(actions.len() as u16)?;
            for (action, q) in actions {
                encoder.write_u32::<BE>(*action)?;
                encoder.write_f32::<BE>(*q)?;
            }
        }
        w.write_all(&encoder.finish()?)?;
        Ok(())
    }

    fn load(&mut self, file: &str, r: &mut dyn Read) -> std::io::Result<()> {
        if file != "qtable.dat" {
            return Err(super::unknown_file(self.kind(), file));
        }
        let mut decoder = flate2::read::GzDecoder::new(r);
        self.progress = Progress::read(&mut decoder)?;
        let positions = decoder.read_u64::<BE>()?;
        let mut table = BTreeMap::new();
        for _ in 0..positions {
            let len = decoder.read_u16::<BE>()? as usize;
            let mut key = vec![0u8; len];
            decoder.read_exact(&mut key)?;
            let key = String::from_utf8(key)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            let count = decoder.read_u16::<BE>()?;
            let mut actions = BTreeMap::new();
            for _ in 0..count {
                let action = decoder.read_u32::<BE>()?;
                let q = decoder.read_f32::<BE>()?;
                actions.insert(action, q);
            }
            table.insert(key, actions);
        }
        self.table = table;
        Ok(())
    }

    fn metrics(&self) -> Metrics {
        let mut metrics = self.progress.metrics();
        metrics.set("positions", self.table.len() as f64);
        metrics.set("epsilon", self.epsilon() as f64);
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::StopToken;
    use crate::save::Dirty;
    use crate::selfplay::Driver;
    use std::sync::Arc;

    fn session(budget: u64) -> Session {
        let mut session = Session::new(
            budget,
            StopToken::new(),
            Arc::new(Driver::new()),
            Dirty::new(),
        );
        session.max_plies = 24;
        session
    }

    #[test]
    fn training_fills_the_table_and_counts_episodes() {
        let mut learner = QTable::new();
        learner.train(&session(3));
        assert!(learner.metrics().episodes() == 3);
        assert!(learner.entries() > 0);
    }

    #[test]
    fn episodes_never_decrease_across_sessions() {
        let mut learner = QTable::new();
        learner.train(&session(2));
        let first = learner.metrics().episodes();
        learner.train(&session(2));
        assert!(learner.metrics().episodes() >= first);
    }

    #[test]
    fn is_load_inverse_save() {
        let mut learner = QTable::new();
        learner.train(&session(2));
        let mut buffer = Vec::new();
        learner.save("qtable.dat", &mut buffer).expect("save");
        let mut restored = QTable::new();
        restored
            .load("qtable.dat", &mut buffer.as_slice())
            .expect("load");
        assert!(restored.table == learner.table);
        assert!(restored.progress == learner.progress);
    }

    #[test]
    fn chooses_only_legal_moves() {
        let mut learner = QTable::new();
        let position = Position::default();
        let legal = crate::chess::Rules::legal_moves(&position, position.turn());
        for _ in 0..32 {
            let m = learner.choose(&position, &legal, true).expect("nonempty");
            assert!(legal.contains(&m));
        }
    }

    #[test]
    fn stop_token_halts_training_early() {
        let mut learner = QTable::new();
        let session = session(1_000_000);
        session.stop.stop();
        learner.train(&session);
        assert!(learner.metrics().episodes() == 0);
    }

    #[test]
    fn rejects_foreign_files() {
        let learner = QTable::new();
        let mut buffer = Vec::new();
        assert!(learner.save("dqn_main.zip", &mut buffer).is_err());
    }
}
