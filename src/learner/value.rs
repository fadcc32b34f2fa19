use super::Kind;
use super::Learner;
use super::Metrics;
use super::Progress;
use super::Session;
use super::model::Network;
use crate::chess::Codec;
use crate::chess::Move;
use crate::chess::Piece;
use crate::chess::Position;
use crate::chess::Rules;
use crate::selfplay::Outcome;
use crate::selfplay::Rollout;
use crate::selfplay::Trajectory;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::io::Read;
use std::io::Write;

const LEARNING_RATE: f32 = 0.01;
const EPSILON: f32 = 0.10;
/// how much of the target is the self-play outcome versus the tabular
/// material signal
const OUTCOME_BLEND: f32 = 0.7;
/// total material on the board at the start, for normalization
const FULL_MATERIAL: f32 = 78.;

/// a single value head regressed by MSE onto a blend of the self-play
/// result and the material count. plays by one-ply lookahead.
pub struct Value {
    net: Network,
    progress: Progress,
    rng: SmallRng,
}

impl Default for Value {
    fn default() -> Self {
        let mut rng = SmallRng::seed_from_u64(rand::rng().random());
        Self {
            net: Network::new(&[64, 64, 1], &mut rng),
            progress: Progress::default(),
            rng,
        }
    }
}

impl Value {
    pub fn new() -> Self {
        Self::default()
    }

    /// position value from the side to move's perspective
    fn value(&self, position: &Position) -> f32 {
        let signed = self.net.forward(&Codec::flat(position))[0];
        signed * position.turn().sign()
    }

    /// material balance in [-1, 1] from White's perspective, the same
    /// frame the raw network output lives in
    fn material(position: &Position) -> f32 {
        let mut balance = 0.;
        for square in crate::chess::Square::all() {
            if let Some((side, piece)) = position.at(square) {
                if piece != Piece::King {
                    balance += piece.value() * side.sign();
                }
            }
        }
        balance / FULL_MATERIAL
    }

    /// the move whose successor the opponent likes least
    fn greedy(&self, position: &Position, legal: &[Move]) -> Option<Move> {
        legal.iter().copied().max_by(|a, b| {
            let va = -self.value(&Rules::apply(position, *a));
            let vb = -self.value(&Rules::apply(position, *b));
            va.partial_cmp(&vb).unwrap_or(std::cmp::Ordering::Equal)
        })
    }

    fn learn(&mut self, trajectory: &Trajectory) {
        let Some(last) = trajectory.steps().last() else {
            return;
        };
        // terminal reward sits in the last mover's frame; fold it back
        // into White's
        let outcome = last.reward * last.before.turn().sign();
        for step in trajectory.steps() {
            let tabular = Self::material(&step.before);
            let target = OUTCOME_BLEND * outcome + (1. - OUTCOME_BLEND) * tabular;
            let input = Codec::flat(&step.before);
            let out = self.net.forward(&input)[0];
            self.net.backward(&input, &[2. * (out - target)], LEARNING_RATE);
        }
    }
}

impl Rollout for Value {
    fn act(&mut self, position: &Position, legal: &[Move]) -> Move {
        self.choose(position, legal, true).unwrap_or(legal[0])
    }
}

impl Learner for Value {
    fn kind(&self) -> Kind {
        Kind::Value
    }

    fn choose(&mut self, position: &Position, legal: &[Move], training: bool) -> Option<Move> {
        use rand::seq::IndexedRandom;
        if legal.is_empty() {
            return None;
        }
        if training && self.rng.random::<f32>() < EPSILON {
            return legal.choose(&mut self.rng).copied();
        }
        self.greedy(position, legal)
    }

    fn train(&mut self, session: &Session) {
        let target = self.progress.episodes + session.budget;
        log::debug!("value training toward episode {}", target);
        while self.progress.episodes < target && !session.stop.stopped() {
            let trajectory = session
                .driver
                .run_episode(self, session.max_plies, &session.stop);
            if trajectory.is_empty() {
                continue;
            }
            self.learn(&trajectory);
            self.progress.absorb(&trajectory);
            session.dirty.mark(Kind::Value);
        }
    }

    fn absorb(&mut self, trajectory: &Trajectory, _: Outcome) {
        self.learn(trajectory);
        self.progress.absorb(trajectory);
    }

    fn save(&self, file: &str, w: &mut dyn Write) -> std::io::Result<()> {
        if file != "value_model.zip" {
            return Err(super::unknown_file(self.kind(), file));
        }
        self.progress.write(w)?;
        self.net.save(w)
    }

    fn load(&mut self, file: &str, r: &mut dyn Read) -> std::io::Result<()> {
        if file != "value_model.zip" {
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
        session.max_plies = 16;
        session
    }

    #[test]
    fn material_is_zero_at_the_start() {
        assert!(Value::material(&Position::default()).abs() < 1e-6);
    }

    #[test]
    fn material_favors_the_side_up_a_queen() {
        let p = Position::from_fen("rnb1kbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1")
            .expect("parse");
        assert!(Value::material(&p) > 0.);
    }

    #[test]
    fn trains_and_marks_dirty() {
        let mut learner = Value::new();
        let session = session(2);
        learner.train(&session);
        assert!(learner.metrics().episodes() == 2);
        assert!(session.dirty.contains(Kind::Value));
    }

    #[test]
    fn is_load_inverse_save() {
        let mut learner = Value::new();
        learner.train(&session(1));
        let mut buffer = Vec::new();
        learner.save("value_model.zip", &mut buffer).expect("save");
        let mut restored = Value::new();
        restored
            .load("value_model.zip", &mut buffer.as_slice())
            .expect("load");
        assert!(restored.net == learner.net);
        assert!(restored.progress == learner.progress);
    }

    #[test]
    fn chooses_only_legal_moves() {
        let mut learner = Value::new();
        let position = Position::default();
        let legal = Rules::legal_moves(&position, position.turn());
        let m = learner.choose(&position, &legal, false).expect("nonempty");
        assert!(legal.contains(&m));
    }
}
