use super::trajectory::Step;
use super::trajectory::Trajectory;
use crate::Reward;
use crate::chess::Book;
use crate::chess::Game;
use crate::chess::Move;
use crate::chess::Position;
use crate::chess::Side;
use crate::chess::Status;
use crate::coordinator::StopToken;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// what the driver needs from whoever is playing out the episode.
/// per-step reward shaping belongs to the actor; the driver only adds
/// terminal rewards.
pub trait Rollout {
    fn act(&mut self, position: &Position, legal: &[Move]) -> Move;
    fn shape(&self, before: &Position, m: &Move, after: &Position) -> Reward {
        let _ = (before, m, after);
        0.
    }
}

/// runs self-play episodes against a virtual game. never consults the
/// tactical arbiter, so training data stays unbiased.
#[derive(Debug, Default)]
pub struct Driver {
    book: Option<Arc<Book>>,
    violations: AtomicU64,
}

impl Driver {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_book(book: Arc<Book>) -> Self {
        Self {
            book: Some(book),
            violations: AtomicU64::new(0),
        }
    }
    /// dropped episodes due to rule violations by the actor or the oracle
    pub fn violations(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }

    /// play one episode to termination, the ply cap, or the stop token.
    /// a stop observed between plies returns the partial trajectory with
    /// no terminal step.
    pub fn run_episode(
        &self,
        actor: &mut dyn Rollout,
        max_plies: usize,
        stop: &StopToken,
    ) -> Trajectory {
        let mut game = match &self.book {
            Some(book) => Game::from_book(book, &mut rand::rng()),
            None => Game::new(),
        };
        let mut trajectory = Trajectory::default();
        while !game.over() && game.plies() < max_plies {
            if stop.stopped() {
                return trajectory;
            }
            let legal = game.legal();
            if legal.is_empty() {
                // the rules oracle contradicted itself; score a draw
                // rather than crash the worker
                log::warn!("no legal moves in a position the rules call ongoing; scoring draw");
                self.violations.fetch_add(1, Ordering::Relaxed);
                return trajectory;
            }
            let before = *game.board();
            let m = actor.act(&before, &legal);
            if !legal.contains(&m) {
                log::warn!("actor proposed illegal move {}; dropping episode", m);
                self.violations.fetch_add(1, Ordering::Relaxed);
                return Trajectory::default();
            }
            game.make(m);
            let after = *game.board();
            let terminal = game.over();
            let mut reward = actor.shape(&before, &m, &after);
            if terminal {
                reward += Self::terminal_reward(&game, before.turn());
            }
            trajectory.push(Step {
                before,
                m,
                reward,
                after,
                terminal,
            });
        }
        trajectory
    }

    /// +1 / 0 / -1 from the perspective of the side that just moved
    fn terminal_reward(game: &Game, mover: Side) -> Reward {
        match game.status() {
            Status::Checkmate(winner) if winner == mover => 1.,
            Status::Checkmate(_) => -1.,
            _ => 0.,
        }
    }
}
