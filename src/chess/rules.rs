use super::board::Position;
use super::moves::Move;
use super::piece::Piece;
use super::piece::Side;
use super::square::Square;

const ROOK_RAYS: [(i8, i8); 4] = [(1, 0), (-1, 0), (0, 1), (0, -1)];
const BISHOP_RAYS: [(i8, i8); 4] = [(1, 1), (1, -1), (-1, 1), (-1, -1)];
const KING_STEPS: [(i8, i8); 8] = [
    (1, 0),
    (-1, 0),
    (0, 1),
    (0, -1),
    (1, 1),
    (1, -1),
    (-1, 1),
    (-1, -1),
];
const KNIGHT_JUMPS: [(i8, i8); 8] = [
    (2, 1),
    (2, -1),
    (-2, 1),
    (-2, -1),
    (1, 2),
    (1, -2),
    (-1, 2),
    (-1, -2),
];
const PROMOTIONS: [Piece; 4] = [Piece::Queen, Piece::Rook, Piece::Bishop, Piece::Knight];

/// how a game stands from the perspective of the rules alone.
/// threefold repetition needs history and is adjudicated by the Game handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ongoing,
    Checkmate(Side),
    Stalemate,
    Draw(DrawReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawReason {
    FiftyMoves,
    Threefold,
    Material,
    Adjudication,
}

/// the rules oracle. every function is deterministic and side-effect-free;
/// successors are fresh values and callers never observe partial state.
pub struct Rules;

impl Rules {
    /// every legal move for one side, king safety included
    pub fn legal_moves(position: &Position, side: Side) -> Vec<Move> {
        let mut moves = Self::pseudo_moves(position, side)
            .into_iter()
            .filter(|m| !Self::is_in_check(&Self::apply(position, *m), side))
            .collect::<Vec<_>>();
        moves.extend(Self::castles(position, side));
        moves
    }

    /// successor position. the move must come from `legal_moves`.
    pub fn apply(position: &Position, m: Move) -> Position {
        let mut next = *position;
        let (side, piece) = position.at(m.from).expect("move origin occupied");
        let captured = position.at(m.to);
        // en passant capture removes a pawn the destination square misses
        if piece == Piece::Pawn && Some(m.to) == position.en_passant() && captured.is_none() {
            let taken = Square::new(m.from.rank(), m.to.file());
            next.put(taken, None);
        }
        // castling is encoded as the two-square king move; the rook follows
        if piece == Piece::King && m.to.file().abs_diff(m.from.file()) == 2 {
            let (from_file, to_file) = if m.to.file() == 6 { (7, 5) } else { (0, 3) };
            let rook_from = Square::new(m.from.rank(), from_file);
            let rook_to = Square::new(m.from.rank(), to_file);
            next.put(rook_from, None);
            next.put(rook_to, Some((side, Piece::Rook)));
        }
        next.put(m.from, None);
        let landed = match piece {
            Piece::Pawn if m.to.rank() == 0 || m.to.rank() == 7 => {
                m.promotion.unwrap_or(Piece::Queen)
            }
            _ => piece,
        };
        next.put(m.to, Some((side, landed)));
        Self::update_rights(&mut next, side, piece, m, captured);
        next.set_en_passant(match piece {
            Piece::Pawn if m.to.rank().abs_diff(m.from.rank()) == 2 => Some(Square::new(
                (m.from.rank() as i8 + side.forward()) as u8,
                m.from.file(),
            )),
            _ => None,
        });
        if piece == Piece::Pawn || captured.is_some() {
            next.set_halfmoves(0);
        } else {
            next.set_halfmoves(position.halfmoves() + 1);
        }
        if side == Side::Black {
            next.set_fullmoves(position.fullmoves() + 1);
        }
        next.set_turn(side.flip());
        next
    }

    /// rules-visible verdict for the side to move
    pub fn status(position: &Position) -> Status {
        let side = position.turn();
        if Self::legal_moves(position, side).is_empty() {
            if Self::is_in_check(position, side) {
                Status::Checkmate(side.flip())
            } else {
                Status::Stalemate
            }
        } else if position.halfmoves() >= 100 {
            Status::Draw(DrawReason::FiftyMoves)
        } else if Self::insufficient_material(position) {
            Status::Draw(DrawReason::Material)
        } else {
            Status::Ongoing
        }
    }

    /// the same position with the move handed to the other side. threat
    /// analysis asks what the opponent could do if we passed.
    pub fn pass(position: &Position) -> Position {
        let mut next = *position;
        next.set_turn(position.turn().flip());
        next.set_en_passant(None);
        next
    }

    /// squares of `by` pieces attacking `target`
    pub fn attackers_of(position: &Position, target: Square, by: Side) -> Vec<Square> {
        position
            .army(by)
            .filter(|(from, piece)| Self::attacks(position, *from, by, *piece, target))
            .map(|(from, _)| from)
            .collect()
    }

    pub fn is_in_check(position: &Position, side: Side) -> bool {
        match position.king(side) {
            Some(king) => !Self::attackers_of(position, king, side.flip()).is_empty(),
            None => false,
        }
    }

    /// captures first, most valuable victim with least valuable attacker;
    /// the dispatcher falls back to the head of this list
    pub fn ordered(position: &Position, moves: &[Move]) -> Vec<Move> {
        let mut moves = moves.to_vec();
        moves.sort_by(|a, b| {
            Self::order_key(position, b)
                .partial_cmp(&Self::order_key(position, a))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        moves
    }
    fn order_key(position: &Position, m: &Move) -> f32 {
        match (position.at(m.to), position.at(m.from)) {
            (Some((_, victim)), Some((_, attacker))) => 100. + victim.value() - attacker.value(),
            _ => 0.,
        }
    }

    fn attacks(position: &Position, from: Square, side: Side, piece: Piece, target: Square) -> bool {
        match piece {
            Piece::Pawn => [(side.forward(), 1), (side.forward(), -1)]
                .iter()
                .any(|(dr, df)| from.shift(*dr, *df) == Some(target)),
            Piece::Knight => KNIGHT_JUMPS
                .iter()
                .any(|(dr, df)| from.shift(*dr, *df) == Some(target)),
            Piece::King => KING_STEPS
                .iter()
                .any(|(dr, df)| from.shift(*dr, *df) == Some(target)),
            Piece::Rook => Self::rays(position, from, &ROOK_RAYS).contains(&target),
            Piece::Bishop => Self::rays(position, from, &BISHOP_RAYS).contains(&target),
            Piece::Queen => {
                Self::rays(position, from, &ROOK_RAYS).contains(&target)
                    || Self::rays(position, from, &BISHOP_RAYS).contains(&target)
            }
        }
    }

    /// squares covered along rays, including the first occupied square
    fn rays(position: &Position, from: Square, directions: &[(i8, i8)]) -> Vec<Square> {
        let mut covered = Vec::new();
        for (dr, df) in directions {
            let mut at = from;
            while let Some(next) = at.shift(*dr, *df) {
                covered.push(next);
                if position.at(next).is_some() {
                    break;
                }
                at = next;
            }
        }
        covered
    }

    /// the squares strictly between two aligned squares, empty or not
    pub fn between(a: Square, b: Square) -> Vec<Square> {
        let dr = (b.rank() as i8 - a.rank() as i8).signum();
        let df = (b.file() as i8 - a.file() as i8).signum();
        let aligned = a.rank() == b.rank()
            || a.file() == b.file()
            || a.rank().abs_diff(b.rank()) == a.file().abs_diff(b.file());
        let mut squares = Vec::new();
        if !aligned {
            return squares;
        }
        let mut at = a;
        while let Some(next) = at.shift(dr, df) {
            if next == b {
                break;
            }
            squares.push(next);
            at = next;
        }
        squares
    }

    fn pseudo_moves(position: &Position, side: Side) -> Vec<Move> {
        let mut moves = Vec::new();
        for (from, piece) in position.army(side) {
            match piece {
                Piece::Pawn => Self::pawn_moves(position, from, side, &mut moves),
                Piece::Knight => Self::step_moves(position, from, side, &KNIGHT_JUMPS, &mut moves),
                Piece::King => Self::step_moves(position, from, side, &KING_STEPS, &mut moves),
                Piece::Rook => Self::ray_moves(position, from, side, &ROOK_RAYS, &mut moves),
                Piece::Bishop => Self::ray_moves(position, from, side, &BISHOP_RAYS, &mut moves),
                Piece::Queen => {
                    Self::ray_moves(position, from, side, &ROOK_RAYS, &mut moves);
                    Self::ray_moves(position, from, side, &BISHOP_RAYS, &mut moves);
                }
            }
        }
        moves
    }

    fn pawn_moves(position: &Position, from: Square, side: Side, moves: &mut Vec<Move>) {
        let dir = side.forward();
        let start = match side {
            Side::White => 1,
            Side::Black => 6,
        };
        if let Some(push) = from.shift(dir, 0) {
            if position.at(push).is_none() {
                Self::pawn_arrivals(from, push, moves);
                if from.rank() == start {
                    if let Some(jump) = from.shift(2 * dir, 0) {
                        if position.at(jump).is_none() {
                            moves.push(Move::new(from, jump));
                        }
                    }
                }
            }
        }
        for df in [-1, 1] {
            if let Some(take) = from.shift(dir, df) {
                match position.at(take) {
                    Some((owner, _)) if owner != side => Self::pawn_arrivals(from, take, moves),
                    None if Some(take) == position.en_passant() => {
                        moves.push(Move::new(from, take));
                    }
                    _ => {}
                }
            }
        }
    }

    /// a pawn arriving on the last rank becomes each promotion candidate
    fn pawn_arrivals(from: Square, to: Square, moves: &mut Vec<Move>) {
        if to.rank() == 0 || to.rank() == 7 {
            moves.extend(PROMOTIONS.iter().map(|p| Move::promote(from, to, *p)));
        } else {
            moves.push(Move::new(from, to));
        }
    }

    fn step_moves(
        position: &Position,
        from: Square,
        side: Side,
        steps: &[(i8, i8)],
        moves: &mut Vec<Move>,
    ) {
        for (dr, df) in steps {
            if let Some(to) = from.shift(*dr, *df) {
                match position.at(to) {
                    Some((owner, _)) if owner == side => {}
                    _ => moves.push(Move::new(from, to)),
                }
            }
        }
    }

    fn ray_moves(
        position: &Position,
        from: Square,
        side: Side,
        directions: &[(i8, i8)],
        moves: &mut Vec<Move>,
    ) {
        for (dr, df) in directions {
            let mut at = from;
            while let Some(to) = at.shift(*dr, *df) {
                match position.at(to) {
                    None => moves.push(Move::new(from, to)),
                    Some((owner, _)) => {
                        if owner != side {
                            moves.push(Move::new(from, to));
                        }
                        break;
                    }
                }
                at = to;
            }
        }
    }

    fn castles(position: &Position, side: Side) -> Vec<Move> {
        let mut moves = Vec::new();
        let rank = match side {
            Side::White => 0,
            Side::Black => 7,
        };
        let king = Square::new(rank, 4);
        if position.at(king) != Some((side, Piece::King)) {
            return moves;
        }
        if Self::is_in_check(position, side) {
            return moves;
        }
        let enemy = side.flip();
        if position.castling().short(side)
            && position.at(Square::new(rank, 7)) == Some((side, Piece::Rook))
            && [5, 6].iter().all(|f| position.at(Square::new(rank, *f)).is_none())
            && [5, 6]
                .iter()
                .all(|f| Self::attackers_of(position, Square::new(rank, *f), enemy).is_empty())
        {
            moves.push(Move::new(king, Square::new(rank, 6)));
        }
        if position.castling().long(side)
            && position.at(Square::new(rank, 0)) == Some((side, Piece::Rook))
            && [1, 2, 3].iter().all(|f| position.at(Square::new(rank, *f)).is_none())
            && [2, 3]
                .iter()
                .all(|f| Self::attackers_of(position, Square::new(rank, *f), enemy).is_empty())
        {
            moves.push(Move::new(king, Square::new(rank, 2)));
        }
        moves
    }

    fn update_rights(
        next: &mut Position,
        side: Side,
        piece: Piece,
        m: Move,
        captured: Option<(Side, Piece)>,
    ) {
        if piece == Piece::King {
            next.castling_mut().revoke(side);
        }
        for (square, short, long) in [
            (Square::new(0, 7), true, false),
            (Square::new(0, 0), false, true),
        ] {
            let white = (square, Side::White);
            let black = (Square::new(7, square.file()), Side::Black);
            for (corner, owner) in [white, black] {
                if m.from == corner || (m.to == corner && captured.is_some()) {
                    let rights = next.castling_mut();
                    match (owner, short, long) {
                        (Side::White, true, _) => rights.white_short = false,
                        (Side::White, _, true) => rights.white_long = false,
                        (Side::Black, true, _) => rights.black_short = false,
                        (Side::Black, _, true) => rights.black_long = false,
                        _ => {}
                    }
                }
            }
        }
    }

    fn insufficient_material(position: &Position) -> bool {
        let mut minors = 0;
        for side in [Side::White, Side::Black] {
            for (_, piece) in position.army(side) {
                match piece {
                    Piece::King => {}
                    Piece::Bishop | Piece::Knight => minors += 1,
                    _ => return false,
                }
            }
        }
        minors <= 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(fen: &str) -> Position {
        Position::from_fen(fen).expect("well formed test position")
    }

    fn count(position: &Position, depth: usize) -> usize {
        if depth == 0 {
            return 1;
        }
        Rules::legal_moves(position, position.turn())
            .iter()
            .map(|m| count(&Rules::apply(position, *m), depth - 1))
            .sum()
    }

    #[test]
    fn perft_from_start() {
        let start = Position::default();
        assert!(count(&start, 1) == 20);
        assert!(count(&start, 2) == 400);
        assert!(count(&start, 3) == 8902);
    }

    #[test]
    fn apply_is_pure() {
        let start = Position::default();
        let before = start.to_fen();
        for m in Rules::legal_moves(&start, Side::White) {
            let _ = Rules::apply(&start, m);
        }
        assert!(start.to_fen() == before);
    }

    #[test]
    fn detects_scholars_mate() {
        let mated = position("r1bqkb1r/pppp1Qpp/2n2n2/4p3/2B1P3/8/PPPP1PPP/RNB1K1NR b KQkq - 0 4");
        assert!(Rules::is_in_check(&mated, Side::Black));
        assert!(Rules::status(&mated) == Status::Checkmate(Side::White));
    }

    #[test]
    fn detects_stalemate() {
        let stuck = position("7k/5Q2/6K1/8/8/8/8/8 b - - 0 1");
        assert!(!Rules::is_in_check(&stuck, Side::Black));
        assert!(Rules::status(&stuck) == Status::Stalemate);
    }

    #[test]
    fn en_passant_capture_removes_pawn() {
        let p = position("rnbqkbnr/ppp1pppp/8/8/3pP3/8/PPPP1PPP/RNBQKBNR b KQkq e3 0 3");
        let take = "d4e3".parse::<Move>().expect("parse");
        assert!(Rules::legal_moves(&p, Side::Black).contains(&take));
        let next = Rules::apply(&p, take);
        assert!(next.at("e4".parse().expect("parse")).is_none());
        assert!(next.at("e3".parse().expect("parse")) == Some((Side::Black, Piece::Pawn)));
    }

    #[test]
    fn castling_moves_both_pieces() {
        let p = position("r3k2r/pppppppp/8/8/8/8/PPPPPPPP/R3K2R w KQkq - 0 1");
        let short = "e1g1".parse::<Move>().expect("parse");
        assert!(Rules::legal_moves(&p, Side::White).contains(&short));
        let next = Rules::apply(&p, short);
        assert!(next.at("g1".parse().expect("parse")) == Some((Side::White, Piece::King)));
        assert!(next.at("f1".parse().expect("parse")) == Some((Side::White, Piece::Rook)));
        assert!(next.at("h1".parse().expect("parse")).is_none());
        assert!(!next.castling().short(Side::White));
        assert!(!next.castling().long(Side::White));
    }

    #[test]
    fn castling_forbidden_through_attack() {
        // black rook on f8 covers f1
        let p = position("5r2/pppppkpp/8/8/8/8/PPPPP1PP/R3K2R w KQ - 0 1");
        let moves = Rules::legal_moves(&p, Side::White);
        assert!(!moves.contains(&"e1g1".parse().expect("parse")));
        assert!(moves.contains(&"e1c1".parse().expect("parse")));
    }

    #[test]
    fn promotion_generates_all_four() {
        let p = position("8/P6k/8/8/8/8/8/K7 w - - 0 1");
        let promotions = Rules::legal_moves(&p, Side::White)
            .into_iter()
            .filter(|m| m.promotion.is_some())
            .count();
        assert!(promotions == 4);
    }

    #[test]
    fn fifty_moves_is_draw() {
        let p = position("7k/8/8/8/8/8/R7/K7 b - - 100 80");
        assert!(Rules::status(&p) == Status::Draw(DrawReason::FiftyMoves));
    }

    #[test]
    fn bare_kings_is_draw() {
        let p = position("7k/8/8/8/8/8/8/K7 w - - 0 1");
        assert!(Rules::status(&p) == Status::Draw(DrawReason::Material));
    }

    #[test]
    fn ordered_puts_captures_first() {
        let p = position("rnbqkbnr/ppp1pppp/8/3p4/4P3/8/PPPP1PPP/RNBQKBNR w KQkq - 0 2");
        let moves = Rules::legal_moves(&p, Side::White);
        let ordered = Rules::ordered(&p, &moves);
        let first = ordered.first().expect("moves exist");
        assert!(p.at(first.to).is_some());
    }
}
