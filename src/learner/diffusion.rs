use super::Kind;
use super::Learner;
use super::Metrics;
use super::Progress;
use super::Session;
use super::model::gaussian;
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
use std::io::Read;
use std::io::Write;

const PREFERENCE_LR: f32 = 0.05;
/// refinement stages unlock as experience accumulates
const UNLOCKS: [u64; 4] = [1_000, 3_000, 6_000, 10_000];
/// noise shrinks with each refinement pass
const SIGMA_START: f32 = 2.5;
const SIGMA_DECAY: f32 = 0.6;

/// denoising-flavored move search: a candidate move is perturbed in
/// (rank, file) coordinate space by gaussian noise and snapped back to
/// the nearest legal move, keeping whichever scores better. deeper
/// refinement unlocks at experience thresholds.
pub struct Diffusion {
    preference: Vec<f32>,
    progress: Progress,
    rng: SmallRng,
}

impl Default for Diffusion {
    fn default() -> Self {
        Self {
            preference: vec![0.; Space::Simple.size() as usize],
            progress: Progress::default(),
            rng: SmallRng::seed_from_u64(rand::rng().random()),
        }
    }
}

impl Diffusion {
    pub fn new() -> Self {
        Self::default()
    }

    /// refinement passes currently unlocked: one, plus one per
    /// threshold crossed
    fn passes(&self) -> usize {
        1 + UNLOCKS
            .iter()
            .filter(|t| self.progress.episodes >= **t)
            .count()
    }

    fn score(&self, m: &Move) -> f32 {
        self.preference[Codec::encode(Space::Simple, m) as usize]
    }

    /// euclidean distance between moves in coordinate space
    fn distance(a: &Move, b: &Move) -> f32 {
        let d = |x: u8, y: u8| (x as f32 - y as f32).powi(2);
        (d(a.from.rank(), b.from.rank())
            + d(a.from.file(), b.from.file())
            + d(a.to.rank(), b.to.rank())
            + d(a.to.file(), b.to.file()))
        .sqrt()
    }

    /// snap perturbed coordinates to the nearest legal move
    fn snap(perturbed: &Move, legal: &[Move]) -> Option<Move> {
        legal.iter().copied().min_by(|a, b| {
            Self::distance(a, perturbed)
                .partial_cmp(&Self::distance(b, perturbed))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    }

    /// jitter a move's endpoints, clamped to the board
    fn perturb(&mut self, m: &Move, sigma: f32) -> Move {
        let jitter = |x: u8, rng: &mut SmallRng| {
            ((x as f32 + gaussian(rng) * sigma).round() as i8).clamp(0, 7) as u8
        };
        let from = crate::chess::Square::new(
            jitter(m.from.rank(), &mut self.rng),
            jitter(m.from.file(), &mut self.rng),
        );
        let to = crate::chess::Square::new(
            jitter(m.to.rank(), &mut self.rng),
            jitter(m.to.file(), &mut self.rng),
        );
        Move::new(from, to)
    }

    /// iterative refinement: start anywhere legal, then repeatedly
    /// denoise toward higher-preference neighborhoods
    fn refine(&mut self, legal: &[Move], exploring: bool) -> Option<Move> {
        use rand::seq::IndexedRandom;
        let mut candidate = match exploring {
            true => *legal.choose(&mut self.rng)?,
            false => legal.iter().copied().max_by(|a, b| {
                self.score(a)
                    .partial_cmp(&self.score(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })?,
        };
        let mut sigma = SIGMA_START;
        for _ in 0..self.passes() {
            let jittered = self.perturb(&candidate, sigma);
            if let Some(snapped) = Self::snap(&jittered, legal) {
                if self.score(&snapped) > self.score(&candidate) {
                    candidate = snapped;
                }
            }
            sigma *= SIGMA_DECAY;
        }
        Some(candidate)
    }

    /// winners' move neighborhoods gain preference, losers' fade
    fn learn(&mut self, trajectory: &Trajectory) {
        let Some(last) = trajectory.steps().last() else {
            return;
        };
        let final_side = last.before.turn();
        for step in trajectory.steps() {
            let gain = match step.before.turn() == final_side {
                true => last.reward,
                false => -last.reward,
            };
            let index = Codec::encode(Space::Simple, &step.m) as usize;
            self.preference[index] += PREFERENCE_LR * gain;
        }
    }
}

impl Rollout for Diffusion {
    fn act(&mut self, position: &Position, legal: &[Move]) -> Move {
        self.choose(position, legal, true).unwrap_or(legal[0])
    }
}

impl Learner for Diffusion {
    fn kind(&self) -> Kind {
        Kind::Diffusion
    }

    fn choose(&mut self, _position: &Position, legal: &[Move], training: bool) -> Option<Move> {
        if legal.is_empty() {
            return None;
        }
        self.refine(legal, training)
    }

    fn train(&mut self, session: &Session) {
        let target = self.progress.episodes + session.budget;
        log::debug!("diffusion training toward episode {}", target);
        while self.progress.episodes < target && !session.stop.stopped() {
            let trajectory = session
                .driver
                .run_episode(self, session.max_plies, &session.stop);
            if trajectory.is_empty() {
                continue;
            }
            self.learn(&trajectory);
            self.progress.absorb(&trajectory);
            session.dirty.mark(Kind::Diffusion);
        }
    }

    fn absorb(&mut self, trajectory: &Trajectory, _: Outcome) {
        self.learn(trajectory);
        self.progress.absorb(trajectory);
    }

    fn save(&self, file: &str, w: &mut dyn Write) -> std::io::Result<()> {
        if file != "diffusion_state.dat" {
            return Err(super::unknown_file(self.kind(), file));
        }
        self.progress.write(w)?;
        w.write_u32::<BE>(self.preference.len() as u32)?;
        for p in &self.preference {
            w.write_f32::<BE>(*p)?;
        }
        Ok(())
    }

    fn load(&mut self, file: &str, r: &mut dyn Read) -> std::io::Result<()> {
        if file != "diffusion_state.dat" {
            return Err(super::unknown_file(self.kind(), file));
        }
        self.progress = Progress::read(r)?;
        let len = r.read_u32::<BE>()? as usize;
        if len != self.preference.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("preference table of {} entries", len),
            ));
        }
        for p in self.preference.iter_mut() {
            *p = r.read_f32::<BE>()?;
        }
        Ok(())
    }

    fn metrics(&self) -> Metrics {
        let mut metrics = self.progress.metrics();
        metrics.set("passes", self.passes() as f64);
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chess::Rules;
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
        session.max_plies = 12;
        session
    }

    #[test]
    fn passes_unlock_at_thresholds() {
        let mut learner = Diffusion::new();
        assert!(learner.passes() == 1);
        learner.progress.episodes = 1_000;
        assert!(learner.passes() == 2);
        learner.progress.episodes = 6_000;
        assert!(learner.passes() == 4);
        learner.progress.episodes = 100_000;
        assert!(learner.passes() == 5);
    }

    #[test]
    fn refinement_stays_legal() {
        let mut learner = Diffusion::new();
        let position = Position::default();
        let legal = Rules::legal_moves(&position, position.turn());
        for _ in 0..64 {
            let m = learner.choose(&position, &legal, true).expect("nonempty");
            assert!(legal.contains(&m));
        }
    }

    #[test]
    fn trains_within_budget() {
        let mut learner = Diffusion::new();
        learner.train(&session(2));
        assert!(learner.metrics().episodes() == 2);
    }

    #[test]
    fn is_load_inverse_save() {
        let mut learner = Diffusion::new();
        learner.train(&session(1));
        let mut buffer = Vec::new();
        learner.save("diffusion_state.dat", &mut buffer).expect("save");
        let mut restored = Diffusion::new();
        restored
            .load("diffusion_state.dat", &mut buffer.as_slice())
            .expect("load");
        assert!(restored.preference == learner.preference);
        assert!(restored.progress == learner.progress);
    }
}
