use super::board::Position;
use super::moves::Move;
use super::piece::Piece;
use super::square::Square;

/// number of floats in the bitplane encoding: one 8x8 plane per {side, piece}
pub const PLANES_LEN: usize = 12 * 64;
/// number of floats in the flat piece-value encoding
pub const FLAT_LEN: usize = 64;
/// simple action space: from * 64 + to
pub const SIMPLE_SPACE: u32 = 64 * 64;
/// plane action space: from * 73 + plane
pub const PLANE_SPACE: u32 = 64 * 73;

const PLANE_DIRECTIONS: [(i8, i8); 8] = [
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
    (-1, -1),
    (0, -1),
    (1, -1),
];
const PLANE_JUMPS: [(i8, i8); 8] = [
    (2, 1),
    (1, 2),
    (-1, 2),
    (-2, 1),
    (-2, -1),
    (-1, -2),
    (1, -2),
    (2, -1),
];
const UNDERPROMOTIONS: [Piece; 3] = [Piece::Knight, Piece::Bishop, Piece::Rook];

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("action index {0} outside the action space")]
    BadIndex(u32),
}

/// the action space a learner is configured against. Simple collapses
/// promotions onto the queen; Planes keeps underpromotions addressable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum Space {
    #[default]
    Simple,
    Planes,
}

impl Space {
    pub fn size(&self) -> u32 {
        match self {
            Self::Simple => SIMPLE_SPACE,
            Self::Planes => PLANE_SPACE,
        }
    }
}

/// fixed tensor encodings of positions and the action-index bijection.
/// `planes`, `flat` and `hash` are total; `decode` fails on indices that
/// name no move in the chosen space.
pub struct Codec;

impl Codec {
    /// 12x8x8 bitplanes, one plane per {side, piece} pair
    pub fn planes(position: &Position) -> [f32; PLANES_LEN] {
        let mut tensor = [0.; PLANES_LEN];
        for square in Square::all() {
            if let Some((side, piece)) = position.at(square) {
                let plane = side.index() * 6 + piece.index();
                tensor[plane * 64 + square.index()] = 1.;
            }
        }
        tensor
    }

    /// 64 piece values in [-10, 10], negated for Black
    pub fn flat(position: &Position) -> [f32; FLAT_LEN] {
        let mut tensor = [0.; FLAT_LEN];
        for square in Square::all() {
            if let Some((side, piece)) = position.at(square) {
                tensor[square.index()] = piece.value() * side.sign();
            }
        }
        tensor
    }

    /// canonical key: identical keys mean game-theoretically equivalent
    /// positions, so move clocks are excluded
    pub fn hash(position: &Position) -> String {
        format!(
            "{} {} {} {}",
            position.placement(),
            position.turn(),
            position.castling(),
            position
                .en_passant()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string()),
        )
    }

    pub fn encode(space: Space, m: &Move) -> u32 {
        match space {
            Space::Simple => (m.from.index() as u32) * 64 + m.to.index() as u32,
            Space::Planes => (m.from.index() as u32) * 73 + Self::plane_of(m),
        }
    }

    pub fn decode(space: Space, index: u32) -> Result<Move, CodecError> {
        if index >= space.size() {
            return Err(CodecError::BadIndex(index));
        }
        match space {
            Space::Simple => {
                let from = Square::try_from((index / 64) as usize).expect("in range");
                let to = Square::try_from((index % 64) as usize).expect("in range");
                Ok(Move::new(from, to))
            }
            Space::Planes => {
                let from = Square::try_from((index / 73) as usize).expect("in range");
                Self::unplane(from, index % 73).ok_or(CodecError::BadIndex(index))
            }
        }
    }

    /// planes 0..56 slide 8 directions x 7 distances, 56..64 are knight
    /// jumps, 64..73 are underpromotions 3 file-deltas x {N, B, R}
    fn plane_of(m: &Move) -> u32 {
        let dr = m.to.rank() as i8 - m.from.rank() as i8;
        let df = m.to.file() as i8 - m.from.file() as i8;
        if let Some(piece) = m.promotion {
            if let Some(p) = UNDERPROMOTIONS.iter().position(|u| *u == piece) {
                let d = (df + 1) as u32;
                return 64 + d * 3 + p as u32;
            }
        }
        if let Some(jump) = PLANE_JUMPS.iter().position(|j| *j == (dr, df)) {
            return 56 + jump as u32;
        }
        let dir = (dr.signum(), df.signum());
        let direction = PLANE_DIRECTIONS
            .iter()
            .position(|d| *d == dir)
            .expect("moves displace");
        let distance = dr.abs().max(df.abs()) as u32;
        direction as u32 * 7 + (distance - 1)
    }

    fn unplane(from: Square, plane: u32) -> Option<Move> {
        match plane {
            0..56 => {
                let (dr, df) = PLANE_DIRECTIONS[(plane / 7) as usize];
                let distance = (plane % 7 + 1) as i8;
                let to = from.shift(dr * distance, df * distance)?;
                Some(Move::new(from, to))
            }
            56..64 => {
                let (dr, df) = PLANE_JUMPS[(plane - 56) as usize];
                let to = from.shift(dr, df)?;
                Some(Move::new(from, to))
            }
            _ => {
                let slot = plane - 64;
                let df = (slot / 3) as i8 - 1;
                let piece = UNDERPROMOTIONS[(slot % 3) as usize];
                // only pawns one step from the last rank underpromote
                let dr = match from.rank() {
                    6 => 1,
                    1 => -1,
                    _ => return None,
                };
                let to = from.shift(dr, df)?;
                Some(Move::promote(from, to, piece))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chess::rules::Rules;

    #[test]
    fn simple_space_is_bijective() {
        for index in 0..SIMPLE_SPACE {
            let m = Codec::decode(Space::Simple, index).expect("every simple index decodes");
            assert!(Codec::encode(Space::Simple, &m) == index);
        }
    }

    #[test]
    fn plane_space_is_bijective_where_decodable() {
        let mut decoded = 0;
        for index in 0..PLANE_SPACE {
            if let Ok(m) = Codec::decode(Space::Planes, index) {
                assert!(Codec::encode(Space::Planes, &m) == index);
                decoded += 1;
            }
        }
        assert!(decoded > 0);
    }

    #[test]
    fn out_of_range_is_bad_index() {
        assert!(Codec::decode(Space::Simple, SIMPLE_SPACE) == Err(CodecError::BadIndex(SIMPLE_SPACE)));
        assert!(Codec::decode(Space::Planes, PLANE_SPACE).is_err());
    }

    #[test]
    fn legal_moves_encode_into_both_spaces() {
        let position = Position::default();
        for m in Rules::legal_moves(&position, position.turn()) {
            assert!(Codec::encode(Space::Simple, &m) < SIMPLE_SPACE);
            assert!(Codec::encode(Space::Planes, &m) < PLANE_SPACE);
        }
    }

    #[test]
    fn planes_mark_every_piece_once() {
        let tensor = Codec::planes(&Position::default());
        let lit = tensor.iter().filter(|x| **x == 1.).count();
        assert!(lit == 32);
    }

    #[test]
    fn flat_values_bounded_and_signed() {
        let tensor = Codec::flat(&Position::default());
        assert!(tensor.iter().all(|x| (-10. ..=10.).contains(x)));
        // white back rank positive, black back rank negative
        assert!(tensor[0] > 0.);
        assert!(tensor[63] < 0.);
    }

    #[test]
    fn hash_excludes_clocks() {
        let a = Position::from_fen("7k/8/8/8/8/8/R7/K7 b - - 0 1").expect("parse");
        let b = Position::from_fen("7k/8/8/8/8/8/R7/K7 b - - 42 90").expect("parse");
        assert!(Codec::hash(&a) == Codec::hash(&b));
    }

    #[test]
    fn hash_separates_side_to_move() {
        let a = Position::from_fen("7k/8/8/8/8/8/R7/K7 w - - 0 1").expect("parse");
        let b = Position::from_fen("7k/8/8/8/8/8/R7/K7 b - - 0 1").expect("parse");
        assert!(Codec::hash(&a) != Codec::hash(&b));
    }
}
