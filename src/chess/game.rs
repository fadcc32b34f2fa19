use super::board::Position;
use super::book::Book;
use super::codec::Codec;
use super::moves::Move;
use super::piece::Side;
use super::rules::DrawReason;
use super::rules::Rules;
use super::rules::Status;
use std::collections::BTreeMap;

/// mutable board handle used by self-play. wraps a Position with the
/// history needed for threefold detection; every state it exposes is
/// reachable by legal play from its seed.
#[derive(Debug, Clone)]
pub struct Game {
    position: Position,
    repetitions: BTreeMap<String, u8>,
    plies: usize,
}

impl Default for Game {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Position> for Game {
    fn from(position: Position) -> Self {
        let mut repetitions = BTreeMap::new();
        repetitions.insert(Codec::hash(&position), 1);
        Self {
            position,
            repetitions,
            plies: 0,
        }
    }
}

impl Game {
    pub fn new() -> Self {
        Self::from(Position::default())
    }

    /// seed from the opening book: a uniformly chosen variation advanced
    /// by 1..=15 plies, stopping early at any terminal position
    pub fn from_book(book: &Book, rng: &mut impl rand::Rng) -> Self {
        let mut game = Self::new();
        for m in book.variation(rng) {
            if game.over() {
                break;
            }
            if !game.legal().contains(&m) {
                log::warn!("opening book proposes illegal move {}", m);
                break;
            }
            game.make(m);
        }
        game
    }

    pub fn board(&self) -> &Position {
        &self.position
    }
    pub fn turn(&self) -> Side {
        self.position.turn()
    }
    pub fn plies(&self) -> usize {
        self.plies
    }
    pub fn legal(&self) -> Vec<Move> {
        Rules::legal_moves(&self.position, self.position.turn())
    }

    /// apply a legal move and fold it into repetition history
    pub fn make(&mut self, m: Move) {
        self.position = Rules::apply(&self.position, m);
        self.plies += 1;
        *self
            .repetitions
            .entry(Codec::hash(&self.position))
            .or_insert(0) += 1;
    }

    pub fn over(&self) -> bool {
        self.status() != Status::Ongoing
    }

    /// rules verdict, with threefold adjudicated from history
    pub fn status(&self) -> Status {
        if self
            .repetitions
            .get(&Codec::hash(&self.position))
            .is_some_and(|n| *n >= 3)
        {
            return Status::Draw(DrawReason::Threefold);
        }
        Rules::status(&self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_game_is_ongoing() {
        let game = Game::new();
        assert!(!game.over());
        assert!(game.plies() == 0);
        assert!(game.legal().len() == 20);
    }

    #[test]
    fn shuffling_knights_reaches_threefold() {
        let mut game = Game::new();
        for _ in 0..2 {
            for m in ["g1f3", "g8f6", "f3g1", "f6g8"] {
                game.make(m.parse().expect("parse"));
            }
        }
        // start position now seen three times
        assert!(game.status() == Status::Draw(DrawReason::Threefold));
    }

    #[test]
    fn book_seeds_stay_legal() {
        let book = Book::default();
        let ref mut rng = rand::rng();
        for _ in 0..32 {
            let game = Game::from_book(&book, rng);
            assert!(game.plies() >= 1);
            assert!(game.plies() <= crate::BOOK_MAX_PLIES);
        }
    }
}
