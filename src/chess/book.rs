use super::moves::Move;

/// curated opening lines in coordinate notation, used to diversify
/// self-play starts. loaded once at startup and shared read-only.
const LINES: [&str; 8] = [
    // ruy lopez
    "e2e4 e7e5 g1f3 b8c6 f1b5 a7a6 b5a4 g8f6 e1g1 f8e7 f1e1 b7b5 a4b3 d7d6",
    // italian game
    "e2e4 e7e5 g1f3 b8c6 f1c4 f8c5 c2c3 g8f6 d2d3 d7d6",
    // sicilian najdorf
    "e2e4 c7c5 g1f3 d7d6 d2d4 c5d4 f3d4 g8f6 b1c3 a7a6",
    // french defense
    "e2e4 e7e6 d2d4 d7d5 b1c3 g8f6 c1g5 f8e7 e4e5 f6d7",
    // caro-kann
    "e2e4 c7c6 d2d4 d7d5 b1c3 d5e4 c3e4 c8f5 e4g3 f5g6",
    // queen's gambit declined
    "d2d4 d7d5 c2c4 e7e6 b1c3 g8f6 c1g5 f8e7 e2e3 e8g8 g1f3 b8d7",
    // king's indian
    "d2d4 g8f6 c2c4 g7g6 b1c3 f8g7 e2e4 d7d6 g1f3 e8g8 f1e2 e7e5",
    // english opening
    "c2c4 e7e5 b1c3 g8f6 g1f3 b8c6 g2g3 d7d5 c4d5 f6d5",
];

/// the opening book. variations are immutable after construction.
#[derive(Debug, Clone)]
pub struct Book {
    variations: Vec<Vec<Move>>,
}

impl Default for Book {
    fn default() -> Self {
        Self {
            variations: LINES
                .iter()
                .map(|line| {
                    line.split_whitespace()
                        .map(|m| m.parse().expect("book moves well formed"))
                        .collect()
                })
                .collect(),
        }
    }
}

impl Book {
    /// a uniformly chosen variation truncated to 1..=15 plies
    pub fn variation(&self, rng: &mut impl rand::Rng) -> Vec<Move> {
        use rand::seq::IndexedRandom;
        let line = self.variations.choose(rng).expect("book nonempty");
        let depth = rng.random_range(crate::BOOK_MIN_PLIES..=crate::BOOK_MAX_PLIES);
        line.iter().take(depth).copied().collect()
    }

    pub fn len(&self) -> usize {
        self.variations.len()
    }
    pub fn is_empty(&self) -> bool {
        self.variations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chess::game::Game;

    #[test]
    fn every_line_replays_legally() {
        let book = Book::default();
        for variation in &book.variations {
            let mut game = Game::new();
            for m in variation {
                assert!(game.legal().contains(m), "illegal book move {}", m);
                game.make(*m);
            }
        }
    }

    #[test]
    fn variations_respect_depth_bounds() {
        let book = Book::default();
        let ref mut rng = rand::rng();
        for _ in 0..64 {
            let n = book.variation(rng).len();
            assert!(n >= crate::BOOK_MIN_PLIES && n <= crate::BOOK_MAX_PLIES);
        }
    }
}
