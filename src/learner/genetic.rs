use super::Kind;
use super::Learner;
use super::Metrics;
use super::Progress;
use super::Session;
use super::model::Network;
use crate::chess::Codec;
use crate::chess::Game;
use crate::chess::Move;
use crate::chess::Position;
use crate::chess::Rules;
use crate::chess::Status;
use crate::selfplay::Rollout;
use byteorder::BE;
use byteorder::ReadBytesExt;
use byteorder::WriteBytesExt;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::io::Read;
use std::io::Write;

const POPULATION: usize = 12;
const ELITES: usize = 2;
const TOURNAMENT: usize = 3;
const MUTATION_SIGMA: f32 = 0.05;
const GAME_PLIES: usize = 60;

/// a fixed-size population of evaluation parameter vectors scored by
/// pairwise play. selection is by tournament, variation by gaussian
/// mutation, and the best two individuals survive unchanged.
pub struct Genetic {
    population: Vec<Network>,
    fitness: Vec<f32>,
    generations: u64,
    progress: Progress,
    rng: SmallRng,
}

impl Default for Genetic {
    fn default() -> Self {
        let mut rng = SmallRng::seed_from_u64(rand::rng().random());
        Self {
            population: (0..POPULATION)
                .map(|_| Network::new(&[64, 16, 1], &mut rng))
                .collect(),
            fitness: vec![0.; POPULATION],
            generations: 0,
            progress: Progress::default(),
            rng,
        }
    }
}

impl Genetic {
    pub fn new() -> Self {
        Self::default()
    }

    fn best(&self) -> &Network {
        self.fitness
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| &self.population[i])
            .unwrap_or(&self.population[0])
    }

    /// one-ply greedy play under an individual's evaluation
    fn pick(net: &Network, position: &Position, legal: &[Move]) -> Option<Move> {
        legal.iter().copied().max_by(|a, b| {
            let value = |m: &Move| {
                let after = Rules::apply(position, *m);
                // the opponent owns the successor
                -net.forward(&Codec::flat(&after))[0] * after.turn().sign()
            };
            value(a)
                .partial_cmp(&value(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    }

    /// a short game between two individuals: 1 / 0.5 / 0 for the first
    fn duel(white: &Network, black: &Network) -> f32 {
        let mut game = Game::new();
        while !game.over() && game.plies() < GAME_PLIES {
            let legal = game.legal();
            let net = match game.turn() {
                crate::chess::Side::White => white,
                crate::chess::Side::Black => black,
            };
            let Some(m) = Self::pick(net, game.board(), &legal) else {
                break;
            };
            game.make(m);
        }
        match game.status() {
            Status::Checkmate(crate::chess::Side::White) => 1.,
            Status::Checkmate(crate::chess::Side::Black) => 0.,
            _ => 0.5,
        }
    }

    /// round-robin scoring, one game per ordered pair, parallel over
    /// the pairings
    fn score(&mut self) -> usize {
        use rayon::iter::IntoParallelIterator;
        use rayon::iter::ParallelIterator;
        let pairings = (0..POPULATION)
            .flat_map(|i| (0..POPULATION).filter(move |j| *j != i).map(move |j| (i, j)))
            .collect::<Vec<_>>();
        let games = pairings.len();
        let results = pairings
            .into_par_iter()
            .map(|(i, j)| {
                let result = Self::duel(&self.population[i], &self.population[j]);
                (i, j, result)
            })
            .collect::<Vec<_>>();
        self.fitness = vec![0.; POPULATION];
        for (i, j, result) in results {
            self.fitness[i] += result;
            self.fitness[j] += 1. - result;
        }
        games
    }

    fn tournament_winner(&mut self) -> usize {
        (0..TOURNAMENT)
            .map(|_| self.rng.random_range(0..POPULATION))
            .max_by(|a, b| {
                self.fitness[*a]
                    .partial_cmp(&self.fitness[*b])
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .expect("tournament nonempty")
    }

    /// elitism, then tournament-selected mutated offspring
    fn evolve(&mut self) {
        let mut ranked = (0..POPULATION).collect::<Vec<_>>();
        ranked.sort_by(|a, b| {
            self.fitness[*b]
                .partial_cmp(&self.fitness[*a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let mut next = ranked
            .iter()
            .take(ELITES)
            .map(|i| self.population[*i].clone())
            .collect::<Vec<_>>();
        while next.len() < POPULATION {
            let parent = self.tournament_winner();
            let mut child = self.population[parent].clone();
            child.perturb(MUTATION_SIGMA, &mut self.rng);
            next.push(child);
        }
        self.population = next;
        self.generations += 1;
    }
}

impl Rollout for Genetic {
    fn act(&mut self, position: &Position, legal: &[Move]) -> Move {
        self.choose(position, legal, true).unwrap_or(legal[0])
    }
}

impl Learner for Genetic {
    fn kind(&self) -> Kind {
        Kind::Genetic
    }

    fn choose(&mut self, position: &Position, legal: &[Move], _training: bool) -> Option<Move> {
        if legal.is_empty() {
            return None;
        }
        Self::pick(self.best(), position, legal)
    }

    /// a generation of pairwise play counts its games as episodes
    fn train(&mut self, session: &Session) {
        let target = self.progress.episodes + session.budget;
        log::debug!("genetic training toward episode {}", target);
        while self.progress.episodes < target && !session.stop.stopped() {
            let games = self.score();
            self.evolve();
            self.progress.episodes += games as u64;
            session.dirty.mark(Kind::Genetic);
        }
        log::debug!(
            "genetic idle at generation {} episode {}",
            self.generations,
            self.progress.episodes
        );
    }

    fn save(&self, file: &str, w: &mut dyn Write) -> std::io::Result<()> {
        if file != "genetic.dat" {
            return Err(super::unknown_file(self.kind(), file));
        }
        self.progress.write(w)?;
        w.write_u64::<BE>(self.generations)?;
        w.write_u16::<BE>(self.population.len() as u16)?;
        for (net, fitness) in self.population.iter().zip(self.fitness.iter()) {
            w.write_f32::<BE>(*fitness)?;
            net.save(w)?;
        }
        Ok(())
    }

    fn load(&mut self, file: &str, r: &mut dyn Read) -> std::io::Result<()> {
        if file != "genetic.dat" {
            return Err(super::unknown_file(self.kind(), file));
        }
        self.progress = Progress::read(r)?;
        self.generations = r.read_u64::<BE>()?;
        let count = r.read_u16::<BE>()? as usize;
        let mut population = Vec::with_capacity(count);
        let mut fitness = Vec::with_capacity(count);
        for _ in 0..count {
            fitness.push(r.read_f32::<BE>()?);
            population.push(Network::load(r)?);
        }
        self.population = population;
        self.fitness = fitness;
        Ok(())
    }

    fn metrics(&self) -> Metrics {
        let mut metrics = self.progress.metrics();
        metrics.set("generations", self.generations as f64);
        metrics.set("population", self.population.len() as f64);
        metrics.set(
            "fitness_best",
            self.fitness.iter().copied().fold(0f32, f32::max) as f64,
        );
        metrics
    }
}
