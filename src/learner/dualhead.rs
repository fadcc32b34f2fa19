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
use crate::chess::Rules;
use crate::chess::Space;
use crate::selfplay::Outcome;
use crate::selfplay::Rollout;
use crate::selfplay::Trajectory;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::io::Read;
use std::io::Write;

const POLICY_LR: f32 = 0.004;
const VALUE_LR: f32 = 0.01;
const TEMPERATURE_FLOOR: f32 = 0.1;

/// separate policy and value networks with a cooling temperature
/// schedule. the value head rescores the policy's legal-move weights
/// before anything is sampled.
pub struct DualHead {
    policy: Network,
    value: Network,
    progress: Progress,
    rng: SmallRng,
}

impl Default for DualHead {
    fn default() -> Self {
        let mut rng = SmallRng::seed_from_u64(rand::rng().random());
        Self {
            policy: Network::new(
                &[crate::chess::codec::PLANES_LEN, 128, Space::Simple.size() as usize],
                &mut rng,
            ),
            value: Network::new(&[64, 64, 1], &mut rng),
            progress: Progress::default(),
            rng,
        }
    }
}

impl DualHead {
    pub fn new() -> Self {
        Self::default()
    }

    /// sampling sharpens as the model matures
    fn temperature(&self) -> f32 {
        (0.9995f32.powi(self.progress.episodes as i32)).max(TEMPERATURE_FLOOR)
    }

    fn mover_value(&self, position: &Position) -> f32 {
        self.value.forward(&Codec::flat(position))[0] * position.turn().sign()
    }

    /// policy weights over the legal moves, tempered, then rescored by
    /// how the value head likes each successor
    fn weights(&self, position: &Position, legal: &[Move]) -> Vec<f32> {
        let temperature = self.temperature();
        let logits = self.policy.forward(&Codec::planes(position));
        let tempered = legal
            .iter()
            .map(|m| logits[Codec::encode(Space::Simple, m) as usize] / temperature)
            .collect::<Vec<_>>();
        let priors = softmax(&tempered);
        let gates = legal
            .iter()
            .map(|m| {
                // the opponent owns the successor, so negate
                let v = -self.mover_value(&Rules::apply(position, *m));
                1. / (1. + (-2. * v).exp())
            })
            .collect::<Vec<_>>();
        let rescored = priors
            .iter()
            .zip(gates.iter())
            .map(|(p, g)| p * (0.5 + g))
            .collect::<Vec<_>>();
        let total = rescored.iter().sum::<f32>().max(1e-12);
        rescored.into_iter().map(|w| w / total).collect()
    }

    fn learn(&mut self, trajectory: &Trajectory) {
        let Some(last) = trajectory.steps().last() else {
            return;
        };
        let outcome = last.reward * last.before.turn().sign();
        let final_side = last.before.turn();
        for step in trajectory.steps() {
            // value head regresses to the outcome in White's frame
            let input = Codec::flat(&step.before);
            let out = self.value.forward(&input)[0];
            self.value
                .backward(&input, &[2. * (out - outcome)], VALUE_LR);
            // policy head reinforces the played move by its result
            let advantage = match step.before.turn() == final_side {
                true => last.reward,
                false => -last.reward,
            };
            if advantage == 0. {
                continue;
            }
            let legal = Rules::legal_moves(&step.before, step.before.turn());
            if legal.is_empty() {
                continue;
            }
            let planes = Codec::planes(&step.before);
            let logits = self.policy.forward(&planes);
            let picked = legal
                .iter()
                .map(|m| logits[Codec::encode(Space::Simple, m) as usize])
                .collect::<Vec<_>>();
            let probs = softmax(&picked);
            let mut grad = vec![0.; self.policy.outputs()];
            for (m, p) in legal.iter().zip(probs.iter()) {
                let y = if *m == step.m { 1. } else { 0. };
                grad[Codec::encode(Space::Simple, m) as usize] = (p - y) * advantage * POLICY_LR;
            }
            self.policy.backward(&planes, &grad, 1.);
        }
    }
}

impl Rollout for DualHead {
    fn act(&mut self, position: &Position, legal: &[Move]) -> Move {
        self.choose(position, legal, true).unwrap_or(legal[0])
    }
}

impl Learner for DualHead {
    fn kind(&self) -> Kind {
        Kind::DualHead
    }

    fn choose(&mut self, position: &Position, legal: &[Move], training: bool) -> Option<Move> {
        use rand::distr::Distribution;
        use rand::distr::weighted::WeightedIndex;
        if legal.is_empty() {
            return None;
        }
        let weights = self.weights(position, legal);
        if training {
            let index = WeightedIndex::new(&weights).ok()?.sample(&mut self.rng);
            legal.get(index).copied()
        } else {
            legal
                .iter()
                .zip(weights.iter())
                .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(m, _)| *m)
        }
    }

    fn train(&mut self, session: &Session) {
        let target = self.progress.episodes + session.budget;
        log::debug!("dual_head training toward episode {}", target);
        while self.progress.episodes < target && !session.stop.stopped() {
            let trajectory = session
                .driver
                .run_episode(self, session.max_plies, &session.stop);
            if trajectory.is_empty() {
                continue;
            }
            self.learn(&trajectory);
            self.progress.absorb(&trajectory);
            session.dirty.mark(Kind::DualHead);
        }
    }

    fn absorb(&mut self, trajectory: &Trajectory, _: Outcome) {
        self.learn(trajectory);
        self.progress.absorb(trajectory);
    }

    fn save(&self, file: &str, w: &mut dyn Write) -> std::io::Result<()> {
        match file {
            "leela_policy.zip" => {
                self.progress.write(w)?;
                self.policy.save(w)
            }
            "leela_value.zip" => self.value.save(w),
            _ => Err(super::unknown_file(self.kind(), file)),
        }
    }

    fn load(&mut self, file: &str, r: &mut dyn Read) -> std::io::Result<()> {
        match file {
            "leela_policy.zip" => {
                self.progress = Progress::read(r)?;
                self.policy = Network::load(r)?;
                Ok(())
            }
            "leela_value.zip" => {
                self.value = Network::load(r)?;
                Ok(())
            }
            _ => Err(super::unknown_file(self.kind(), file)),
        }
    }

    fn metrics(&self) -> Metrics {
        let mut metrics = self.progress.metrics();
        metrics.set("temperature", self.temperature() as f64);
        metrics.set(
            "parameters",
            (self.policy.parameters() + self.value.parameters()) as f64,
        );
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
        session.max_plies = 10;
        session
    }

    #[test]
    fn weights_are_a_distribution_over_legal_moves() {
        let learner = DualHead::new();
        let position = Position::default();
        let legal = Rules::legal_moves(&position, position.turn());
        let weights = learner.weights(&position, &legal);
        assert!(weights.len() == legal.len());
        assert!((weights.iter().sum::<f32>() - 1.).abs() < 1e-4);
    }

    #[test]
    fn temperature_cools_with_experience() {
        let mut learner = DualHead::new();
        let hot = learner.temperature();
        learner.progress.episodes = 5_000;
        assert!(learner.temperature() < hot);
        learner.progress.episodes = 1_000_000;
        assert!(learner.temperature() == TEMPERATURE_FLOOR);
    }

    #[test]
    fn trains_within_budget() {
        let mut learner = DualHead::new();
        learner.train(&session(2));
        assert!(learner.metrics().episodes() == 2);
    }

    #[test]
    fn is_load_inverse_save_across_both_files() {
        let mut learner = DualHead::new();
        learner.train(&session(1));
        let mut restored = DualHead::new();
        for file in Kind::DualHead.files() {
            let mut buffer = Vec::new();
            learner.save(file, &mut buffer).expect("save");
            restored.load(file, &mut buffer.as_slice()).expect("load");
        }
        assert!(restored.policy == learner.policy);
        assert!(restored.value == learner.value);
        assert!(restored.progress == learner.progress);
    }
}
