use super::Kind;
use super::Learner;
use super::Metrics;
use super::Progress;
use super::Session;
use crate::chess::Codec;
use crate::chess::Move;
use crate::chess::Piece;
use crate::chess::Position;
use crate::chess::Rules;
use crate::chess::Space;
use crate::chess::Square;
use crate::chess::Status;
use crate::selfplay::Rollout;
use byteorder::BE;
use byteorder::ReadBytesExt;
use byteorder::WriteBytesExt;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::collections::BTreeMap;
use std::io::Read;
use std::io::Write;

const SIMULATIONS: usize = 64;
const EXPLORATION: f32 = 1.4;
const ROLLOUT_PLIES: usize = 16;
const CACHE_CAP: usize = 50_000;

#[derive(Debug, Clone, Copy, Default)]
struct Edge {
    visits: u32,
    total: f32,
}

impl Edge {
    fn q(&self) -> f32 {
        match self.visits {
            0 => 0.,
            n => self.total / n as f32,
        }
    }
}

/// plain UCT: no neural priors, leaves scored by short random rollouts
/// against the material count. visit statistics persist across games as
/// the learner's whole model.
pub struct MctsLite {
    cache: BTreeMap<String, BTreeMap<u32, Edge>>,
    progress: Progress,
    rng: SmallRng,
}

impl Default for MctsLite {
    fn default() -> Self {
        Self {
            cache: BTreeMap::new(),
            progress: Progress::default(),
            rng: SmallRng::seed_from_u64(rand::rng().random()),
        }
    }
}

impl MctsLite {
    pub fn new() -> Self {
        Self::default()
    }

    fn simulate(&mut self, position: &Position, depth: usize) -> f32 {
        match Rules::status(position) {
            Status::Checkmate(_) => return -1.,
            Status::Stalemate | Status::Draw(_) => return 0.,
            Status::Ongoing => {}
        }
        if depth == 0 {
            return self.rollout(position);
        }
        let legal = Rules::legal_moves(position, position.turn());
        let key = Codec::hash(position);
        if !self.cache.contains_key(&key) {
            let edges = legal
                .iter()
                .map(|m| (Codec::encode(Space::Simple, m), Edge::default()))
                .collect();
            self.insert(key, edges);
            return self.rollout(position);
        }
        let rollouts = self.cache[&key].values().map(|e| e.visits).sum::<u32>().max(1) as f32;
        let chosen = legal
            .iter()
            .copied()
            .max_by(|a, b| {
                let uct = |m: &Move| {
                    let e = self.cache[&key]
                        .get(&Codec::encode(Space::Simple, m))
                        .copied()
                        .unwrap_or_default();
                    e.q() + EXPLORATION * (rollouts.ln().max(0.) / (1. + e.visits as f32)).sqrt()
                };
                uct(a).partial_cmp(&uct(b)).unwrap_or(std::cmp::Ordering::Equal)
            })
            .expect("legal nonempty while ongoing");
        let value = -self.simulate(&Rules::apply(position, chosen), depth - 1);
        if let Some(edge) = self
            .cache
            .get_mut(&key)
            .and_then(|edges| edges.get_mut(&Codec::encode(Space::Simple, &chosen)))
        {
            edge.visits += 1;
            edge.total += value;
        }
        value
    }

    /// random playout capped at a few plies, settled by material
    fn rollout(&mut self, position: &Position) -> f32 {
        use rand::seq::IndexedRandom;
        let mut current = *position;
        for _ in 0..ROLLOUT_PLIES {
            match Rules::status(&current) {
                Status::Checkmate(winner) => {
                    return if winner == position.turn() { 1. } else { -1. };
                }
                Status::Stalemate | Status::Draw(_) => return 0.,
                Status::Ongoing => {}
            }
            let legal = Rules::legal_moves(&current, current.turn());
            let Some(m) = legal.choose(&mut self.rng) else {
                return 0.;
            };
            current = Rules::apply(&current, *m);
        }
        Self::material(&current) * position.turn().sign()
    }

    /// material balance squeezed into [-1, 1], White positive
    fn material(position: &Position) -> f32 {
        let mut balance = 0.;
        for square in Square::all() {
            if let Some((side, piece)) = position.at(square) {
                if piece != Piece::King {
                    balance += piece.value() * side.sign();
                }
            }
        }
        (balance / 20.).clamp(-1., 1.)
    }

    /// a full cache restarts from scratch rather than evicting cleverly
    fn insert(&mut self, key: String, edges: BTreeMap<u32, Edge>) {
        if self.cache.len() >= CACHE_CAP {
            log::debug!("mcts_lite cache full; clearing {} entries", self.cache.len());
            self.cache.clear();
        }
        self.cache.insert(key, edges);
    }

    fn ponder(&mut self, position: &Position, legal: &[Move]) -> Option<Move> {
        for _ in 0..SIMULATIONS {
            self.simulate(position, ROLLOUT_PLIES);
        }
        let key = Codec::hash(position);
        let edges = self.cache.get(&key)?;
        legal.iter().copied().max_by_key(|m| {
            edges
                .get(&Codec::encode(Space::Simple, m))
                .map(|e| e.visits)
                .unwrap_or(0)
        })
    }
}

impl Rollout for MctsLite {
    fn act(&mut self, position: &Position, legal: &[Move]) -> Move {
        self.choose(position, legal, true).unwrap_or(legal[0])
    }
}

impl Learner for MctsLite {
    fn kind(&self) -> Kind {
        Kind::MctsLite
    }

    fn choose(&mut self, position: &Position, legal: &[Move], _training: bool) -> Option<Move> {
        if legal.is_empty() {
            return None;
        }
        self.ponder(position, legal)
    }

    fn train(&mut self, session: &Session) {
        let target = self.progress.episodes + session.budget;
        log::debug!("mcts_lite training toward episode {}", target);
        while self.progress.episodes < target && !session.stop.stopped() {
            let trajectory = session
                .driver
                .run_episode(self, session.max_plies, &session.stop);
            if trajectory.is_empty() {
                continue;
            }
            self.progress.absorb(&trajectory);
            session.dirty.mark(Kind::MctsLite);
        }
    }

    fn save(&self, file: &str, w: &mut dyn Write) -> std::io::Result<()> {
        if file != "mcts_lite.dat" {
            return Err(super::unknown_file(self.kind(), file));
        }
        self.progress.write(w)?;
        w.write_u64::<BE>(self.cache.len() as u64)?;
        for (key, edges) in &self.cache {
            w.write_u16::<BE>(key.len() as u16)?;
            w.write_all(key.as_bytes())?;
            w.write_u16::<BE>(edges.len() as u16)?;
            for (index, edge) in edges {
                w.write_u32::<BE>(*index)?;
                w.write_u32::<BE>(edge.visits)?;
                w.write_f32::<BE>(edge.total)?;
            }
        }
        Ok(())
    }

    fn load(&mut self, file: &str, r: &mut dyn Read) -> std::io::Result<()> {
        if file != "mcts_lite.dat" {
            return Err(super::unknown_file(self.kind(), file));
        }
        self.progress = Progress::read(r)?;
        let positions = r.read_u64::<BE>()?;
        let mut cache = BTreeMap::new();
        for _ in 0..positions {
            let len = r.read_u16::<BE>()? as usize;
            let mut key = vec![0u8; len];
            r.read_exact(&mut key)?;
            let key = String::from_utf8(key)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            let count = r.read_u16::<BE>()?;
            let mut edges = BTreeMap::new();
            for _ in 0..count {
                let index = r.read_u32::<BE>()?;
                let visits = r.read_u32::<BE>()?;
                let total = r.read_f32::<BE>()?;
                edges.insert(index, Edge { visits, total });
            }
            cache.insert(key, edges);
        }
        self.cache = cache;
        Ok(())
    }

    fn metrics(&self) -> Metrics {
        let mut metrics = self.progress.metrics();
        metrics.set("cache", self.cache.len() as f64);
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
        let mut learner = MctsLite::new();
        let position = Position::from_fen("6k1/5ppp/8/8/8/8/8/R5K1 w - - 0 1").expect("parse");
        let legal = Rules::legal_moves(&position, position.turn());
        let m = learner.choose(&position, &legal, false).expect("nonempty");
        assert!(m == "a1a8".parse().expect("parse"));
    }

    #[test]
    fn trains_and_grows_the_cache() {
        let mut learner = MctsLite::new();
        learner.train(&session(1));
        assert!(learner.metrics().episodes() == 1);
        assert!(!learner.cache.is_empty());
    }

    #[test]
    fn is_load_inverse_save() {
        let mut learner = MctsLite::new();
        learner.train(&session(1));
        let mut buffer = Vec::new();
        learner.save("mcts_lite.dat", &mut buffer).expect("save");
        let mut restored = MctsLite::new();
        restored
            .load("mcts_lite.dat", &mut buffer.as_slice())
            .expect("load");
        assert!(restored.cache.len() == learner.cache.len());
        assert!(restored.progress == learner.progress);
    }
}
