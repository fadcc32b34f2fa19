pub mod board;
pub mod book;
pub mod codec;
pub mod game;
pub mod moves;
pub mod piece;
pub mod rules;
pub mod square;

pub use board::Castling;
pub use board::Position;
pub use book::Book;
pub use codec::Codec;
pub use codec::Space;
pub use game::Game;
pub use moves::Move;
pub use piece::Piece;
pub use piece::Side;
pub use rules::DrawReason;
pub use rules::Rules;
pub use rules::Status;
pub use square::Square;
