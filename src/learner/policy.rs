use super::Kind;
use super::Learner;
use super::Metrics;
use super::Progress;
use super::Session;
use super::model::Network;
use super::model::softmax;
use crate::chess::Codec;
use crate::chess::Move;
use crate::chess::Position;
use crate::chess::Space;
use crate::selfplay::Outcome;
use crate::selfplay::Rollout;
use crate::selfplay::Trajectory;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::io::Read;
use std::io::Write;

const LEARNING_RATE: f32 = 0.005;

/// a policy head over bitplane input, trained by policy gradient on the
/// self-play outcome. samples while training, plays the mode live.
pub struct PolicyCnn {
    net: Network,
    progress: Progress,
    rng: SmallRng,
}

impl Default for PolicyCnn {
    fn default() -> Self {
        let mut rng = SmallRng::seed_from_u64(rand::rng().random());
        Self {
            net: Network::new(&[crate::chess::codec::PLANES_LEN, 128, Space::Simple.size() as usize], &mut rng),
            progress: Progress::default(),
            rng,
        }
    }
}

impl PolicyCnn {
    pub fn new() -> Self {
        Self::default()
    }

    /// probabilities over the legal moves only
    fn distribution(&self, position: &Position, legal: &[Move]) -> Vec<f32> {
        let logits = self.net.forward(&Codec::planes(position));
        let picked = legal
            .iter()
            .map(|m| logits[Codec::encode(Space::Simple, m) as usize])
            .collect::<Vec<_>>();
        softmax(&picked)
    }

    /// REINFORCE step: nudge played actions by the final outcome seen
    /// from each mover's own side, with the softmax gradient masked to
    /// the legal candidates
    fn learn(&mut self, trajectory: &Trajectory) {
        let Some(last) = trajectory.steps().last() else {
            return;
        };
        let final_side = last.before.turn();
        for step in trajectory.steps() {
            let advantage = match step.before.turn() == final_side {
                true => last.reward,
                false => -last.reward,
            };
            if advantage == 0. {
                continue;
            }
            let legal = crate::chess::Rules::legal_moves(&step.before, step.before.turn());
            if legal.is_empty() {
                continue;
            }
            let input = Codec::planes(&step.before);
            let probs = self.distribution(&step.before, &legal);
            let mut grad = vec![0.; self.net.outputs()];
            for (m, p) in legal.iter().zip(probs.iter()) {
                let index = Codec::encode(Space::Simple, m) as usize;
                let y = if *m == step.m { 1. } else { 0. };
                grad[index] = (p - y) * advantage * LEARNING_RATE;
            }
            self.net.backward(&input, &grad, 1.);
        }
    }

    fn sample(&mut self, position: &Position, legal: &[Move]) -> Option<Move> {
        use rand::distr::Distribution;
        use rand::distr::weighted::WeightedIndex;
        let probs = self.distribution(position, legal);
        let index = WeightedIndex::new(&probs).ok()?.sample(&mut self.rng);
        legal.get(index).copied()
    }

    fn mode(&self, position: &Position, legal: &[Move]) -> Option<Move> {
        let probs = self.distribution(position, legal);
        legal
            .iter()
            .zip(probs.iter())
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(m, _)| *m)
    }
}

impl Rollout for PolicyCnn {
    fn act(&mut self, position: &Position, legal: &[Move]) -> Move {
        self.choose(position, legal, true).unwrap_or(legal[0])
    }
}

impl Learner for PolicyCnn {
    fn kind(&self) -> Kind {
        Kind::PolicyCnn
    }

    fn choose(&mut self, position: &Position, legal: &[Move], training: bool) -> Option<Move> {
        if legal.is_empty() {
            return None;
        }
        if training {
            self.sample(position, legal)
        } else {
            self.mode(position, legal)
        }
    }

    fn train(&mut self, session: &Session) {
        let target = self.progress.episodes + session.budget;
        log::debug!("policy_cnn training toward episode {}", target);
        while self.progress.episodes < target && !session.stop.stopped() {
            let trajectory = session
                .driver
                .run_episode(self, session.max_plies, &session.stop);
            if trajectory.is_empty() {
                continue;
            }
            self.learn(&trajectory);
            self.progress.absorb(&trajectory);
            session.dirty.mark(Kind::PolicyCnn);
        }
    }

    fn absorb(&mut self, trajectory: &Trajectory, _: Outcome) {
        self.learn(trajectory);
        self.progress.absorb(trajectory);
    }

    fn save(&self, file: &str, w: &mut dyn Write) -> std::io::Result<()> {
        if file != "policy_cnn.zip" {
            return Err(super::unknown_file(self.kind(), file));
        }
        self.progress.write(w)?;
        self.net.save(w)
    }

    fn load(&mut self, file: &str, r: &mut dyn Read) -> std::io::Result<()> {
        if file != "policy_cnn.zip" {
            return Err(super::unknown_file(self.kind(), file));
        }
        self.progress = Progress::read(r)?;
        self.net = Network::load(r)?;
        Ok(())
    }

    fn metrics(&self) -> Metrics {
        let mut metrics = self.progress.metrics();
        metrics.set("parameters", self.net.parameters() as f64);
        metrics
    }
}
