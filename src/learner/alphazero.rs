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
use crate::chess::Status;
use crate::selfplay::Rollout;
use crate::selfplay::Trajectory;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::collections::BTreeMap;
use std::io::Read;
use std::io::Write;

const SIMULATIONS: usize = 48;
const CPUCT: f32 = 1.5;
const MAX_DEPTH: usize = 24;
const LEARNING_RATE: f32 = 0.002;
/// sampling temperature while training; live play is argmax
const TEMPERATURE: f32 = 1.;

#[derive(Debug, Clone, Copy, Default)]
struct Stats {
    visits: u32,
    total: f32,
    prior: f32,
}

impl Stats {
    fn q(&self) -> f32 {
        match self.visits {
            0 => 0.,
            n => self.total / n as f32,
        }
    }
}

/// PUCT search guided by a joint policy/value head. self-play yields
/// (position, visit distribution, outcome) triples the net regresses on.
pub struct AlphaZero {
    net: Network,
    tree: BTreeMap<String, BTreeMap<u32, Stats>>,
    pending: Vec<(Position, Vec<(u32, f32)>)>,
    progress: Progress,
    rng: SmallRng,
}

impl AlphaZero {
    pub fn new() -> Self {
        let mut rng = SmallRng::seed_from_u64(rand::rng().random());
        Self {
            net: Network::new(
                &[
                    crate::chess::codec::PLANES_LEN,
                    128,
                    Space::Simple.size() as usize + 1,
                ],
                &mut rng,
            ),
            tree: BTreeMap::new(),
            pending: Vec::new(),
            progress: Progress::default(),
            rng,
        }
    }

    /// policy priors over the legal moves and the scalar value, one
    /// forward pass
    fn evaluate(&self, position: &Position, legal: &[Move]) -> (Vec<f32>, f32) {
        let out = self.net.forward(&Codec::planes(position));
        let value = out[out.len() - 1].clamp(-1., 1.);
        let logits = legal
            .iter()
            .map(|m| out[Codec::encode(Space::Simple, m) as usize])
            .collect::<Vec<_>>();
        (softmax(&logits), value)
    }

    /// one simulation from the root. returns the value from the side
    /// to move's perspective; parents negate.
    fn simulate(&mut self, position: &Position, depth: usize) -> f32 {
        match Rules::status(position) {
            // the side to move is the one who got mated
            Status::Checkmate(_) => return -1.,
            Status::Stalemate | Status::Draw(_) => return 0.,
            Status::Ongoing => {}
        }
        let legal = Rules::legal_moves(position, position.turn());
        if legal.is_empty() || depth == 0 {
            return 0.;
        }
        let key = Codec::hash(position);
        if !self.tree.contains_key(&key) {
            let (priors, value) = self.evaluate(position, &legal);
            let mut edges = BTreeMap::new();
            for (m, p) in legal.iter().zip(priors) {
                edges.insert(
                    Codec::encode(Space::Simple, m),
                    Stats {
                        prior: p,
                        ..Stats::default()
                    },
                );
            }
            self.tree.insert(key, edges);
            return value;
        }
        let rollouts = self.tree[&key]
            .values()
            .map(|s| s.visits)
            .sum::<u32>()
            .max(1) as f32;
        let chosen = legal
            .iter()
            .copied()
            .max_by(|a, b| {
                let ucb = |m: &Move| {
                    let s = self.tree[&key][&Codec::encode(Space::Simple, m)];
                    s.q() + CPUCT * s.prior * rollouts.sqrt() / (1. + s.visits as f32)
                };
                ucb(a).partial_cmp(&ucb(b)).unwrap_or(std::cmp::Ordering::Equal)
            })
            .expect("legal nonempty");
        let value = -self.simulate(&Rules::apply(position, chosen), depth - 1);
        let edge = self
            .tree
            .get_mut(&key)
            .and_then(|edges| edges.get_mut(&Codec::encode(Space::Simple, &chosen)))
            .expect("edge expanded above");
        edge.visits += 1;
        edge.total += value;
        value
    }

    /// run the search and return the normalized visit distribution
    fn ponder(&mut self, position: &Position, legal: &[Move]) -> Vec<(u32, f32)> {
        for _ in 0..SIMULATIONS {
            self.simulate(position, MAX_DEPTH);
        }
        let key = Codec::hash(position);
        let total = self.tree[&key].values().map(|s| s.visits).sum::<u32>().max(1) as f32;
        legal
            .iter()
            .map(|m| {
                let index = Codec::encode(Space::Simple, m);
                (index, self.tree[&key][&index].visits as f32 / total)
            })
            .collect()
    }

    /// regress the policy head onto the visit distribution and the
    /// value head onto the outcome
    fn learn(&mut self, trajectory: &Trajectory) {
        let Some(last) = trajectory.steps().last() else {
            self.pending.clear();
            return;
        };
        let final_side = last.before.turn();
        let pending = std::mem::take(&mut self.pending);
        for ((position, visits), step) in pending.iter().zip(trajectory.steps()) {
            let z = match step.before.turn() == final_side {
                true => last.reward,
                false => -last.reward,
            };
            let input = Codec::planes(position);
            let out = self.net.forward(&input);
            let value_slot = out.len() - 1;
            let logits = visits
                .iter()
                .map(|(index, _)| out[*index as usize])
                .collect::<Vec<_>>();
            let probs = softmax(&logits);
            let mut grad = vec![0.; out.len()];
            for ((index, pi), p) in visits.iter().zip(probs.iter()) {
                grad[*index as usize] = (p - pi) * LEARNING_RATE;
            }
            grad[value_slot] = 2. * (out[value_slot] - z) * LEARNING_RATE;
            self.net.backward(&input, &grad, 1.);
        }
        // stale search statistics would bias the next episode's priors
        self.tree.clear();
    }

    fn pick(&mut self, visits: &[(u32, f32)], legal: &[Move], training: bool) -> Option<Move> {
        use rand::distr::Distribution;
        use rand::distr::weighted::WeightedIndex;
        if training {
            let weights = visits
                .iter()
                .map(|(_, v)| v.powf(1. / TEMPERATURE).max(1e-6))
                .collect::<Vec<_>>();
            let index = WeightedIndex::new(&weights).ok()?.sample(&mut self.rng);
            legal.get(index).copied()
        } else {
            visits
                .iter()
                .zip(legal.iter())
                .max_by(|((_, a), _), ((_, b), _)| {
                    a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(_, m)| *m)
        }
    }
}

impl Rollout for AlphaZero {
    fn act(&mut self, position: &Position, legal: &[Move]) -> Move {
        let visits = self.ponder(position, legal);
        let chosen = self.pick(&visits, legal, true).unwrap_or(legal[0]);
        self.pending.push((*position, visits));
        chosen
    }
}

impl Learner for AlphaZero {
    fn kind(&self) -> Kind {
        Kind::AlphaZero
    }

    fn choose(&mut self, position: &Position, legal: &[Move], training: bool) -> Option<Move> {
        if legal.is_empty() {
            return None;
        }
        let visits = self.ponder(position, legal);
        self.pick(&visits, legal, training)
    }

    fn train(&mut self, session: &Session) {
        let target = self.progress.episodes + session.budget;
        log::debug!("alphazero training toward episode {}", target);
        while self.progress.episodes < target && !session.stop.stopped() {
            let trajectory = session
                .driver
                .run_episode(self, session.max_plies, &session.stop);
            if trajectory.is_empty() {
                self.pending.clear();
                continue;
            }
            self.learn(&trajectory);
            self.progress.absorb(&trajectory);
            session.dirty.mark(Kind::AlphaZero);
        }
    }

    fn save(&self, file: &str, w: &mut dyn Write) -> std::io::Result<()> {
        if file != "alphazero_cache.dat" {
            return Err(super::unknown_file(self.kind(), file));
        }
        self.progress.write(w)?;
        self.net.save(w)
    }

    fn load(&mut self, file: &str, r: &mut dyn Read) -> std::io::Result<()> {
        if file != "alphazero_cache.dat" {
            return Err(super::unknown_file(self.kind(), file));
        }
        self.progress = Progress::read(r)?;
        self.net = Network::load(r)?;
        Ok(())
    }

    fn metrics(&self) -> Metrics {
        let mut metrics = self.progress.metrics();
        metrics.set("tree", self.tree.len() as f64);
        metrics.set("parameters", self.net.parameters() as f64);
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
        session.max_plies = 6;
        session
    }

    #[test]
    fn search_finds_mate_in_one() {
        let mut learner = AlphaZero::new();
        let position =
            Position::from_fen("6k1/5ppp/8/8/8/8/8/R5K1 w - - 0 1").expect("parse");
        let legal = Rules::legal_moves(&position, position.turn());
        let m = learner.choose(&position, &legal, false).expect("nonempty");
        assert!(m == "a1a8".parse().expect("parse"));
    }

    #[test]
    fn visit_distribution_is_normalized() {
        let mut learner = AlphaZero::new();
        let position = Position::default();
        let legal = Rules::legal_moves(&position, position.turn());
        let visits = learner.ponder(&position, &legal);
        let total = visits.iter().map(|(_, v)| v).sum::<f32>();
        assert!((total - 1.).abs() < 1e-3);
    }

    #[test]
    fn trains_within_budget() {
        let mut learner = AlphaZero::new();
        learner.train(&session(1));
        assert!(learner.metrics().episodes() == 1);
    }

    #[test]
    fn is_load_inverse_save() {
        let mut learner = AlphaZero::new();
        let mut buffer = Vec::new();
        learner.save("alphazero_cache.dat", &mut buffer).expect("save");
        let mut restored = AlphaZero::new();
        restored
            .load("alphazero_cache.dat", &mut buffer.as_slice())
            .expect("load");
        assert!(restored.net == learner.net);
    }
}
