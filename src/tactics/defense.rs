use super::threat::Severity;
use super::threat::Threat;
use crate::chess::Move;
use crate::chess::Position;
use crate::chess::Rules;
use crate::chess::Side;
use crate::chess::Square;
use crate::chess::Status;

/// threats below this rank are observed but never answered
const THRESHOLD: u32 = 300;

/// the arbiter's verdict: a move, the severity that demanded it, and
/// whether the dispatcher may let the learner overrule it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Defense {
    pub m: Move,
    pub severity: Severity,
}

impl Defense {
    /// a mate defense pins the move; the learner cannot overrule
    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Checkmate
    }
}

/// pure, stateless severity-ranked threat arbiter. consulted only for
/// live-game moves, never during self-play.
pub struct Arbiter;

impl Arbiter {
    /// the highest-severity verified defensive move among `legal`, or
    /// None when no threat crosses the threshold or none is answerable
    pub fn best_defense(position: &Position, legal: &[Move], side: Side) -> Option<Defense> {
        for threat in Threat::scan(position, side) {
            let severity = threat.severity();
            if severity.rank() < THRESHOLD {
                return None;
            }
            let defense = match &threat {
                Threat::Mate { mating } => Self::avert_mate(position, legal, side, mating),
                Threat::Hanging {
                    square, attackers, ..
                } => Self::rescue(position, legal, side, *square, attackers),
                Threat::Pattern { attacker, targets } => {
                    Self::unravel(position, legal, side, *attacker, targets)
                }
                Threat::Pressure { .. } => None,
            };
            if let Some(m) = defense {
                log::info!(
                    "arbiter overrides with {} (severity {} = {})",
                    m,
                    severity,
                    severity.rank(),
                );
                return Some(Defense { m, severity });
            }
        }
        None
    }

    /// block the mating line with the cheapest piece nearest the landing
    /// square, capture the would-be mater, then walk the king out. a
    /// candidate counts only if no mate-in-1 survives it.
    fn avert_mate(
        position: &Position,
        legal: &[Move],
        side: Side,
        mating: &[Move],
    ) -> Option<Move> {
        let king = position.king(side)?;
        for threat in mating {
            let attacker = position.at(threat.from).map(|(_, p)| p)?;
            if attacker.slides() {
                let mut lane = Rules::between(threat.from, threat.to);
                // nearest the landing square first
                lane.reverse();
                for square in lane {
                    let mut blocks = legal
                        .iter()
                        .filter(|m| m.to == square && m.from != king)
                        .copied()
                        .collect::<Vec<_>>();
                    blocks.sort_by(|a, b| {
                        let value = |m: &Move| {
                            position.at(m.from).map(|(_, p)| p.value()).unwrap_or(0.)
                        };
                        value(a).partial_cmp(&value(b)).unwrap_or(std::cmp::Ordering::Equal)
                    });
                    for m in blocks {
                        if Self::averts(position, side, m) {
                            return Some(m);
                        }
                    }
                }
            }
            for m in legal.iter().filter(|m| m.to == threat.from) {
                if Self::averts(position, side, *m) {
                    return Some(*m);
                }
            }
        }
        let escapes = legal.iter().filter(|m| m.from == king);
        for m in escapes {
            if Self::averts(position, side, *m) {
                return Some(*m);
            }
        }
        // anything goes when the usual remedies fail
        legal.iter().copied().find(|m| Self::averts(position, side, *m))
    }

    /// no opponent mate-in-1 remains after making this move
    fn averts(position: &Position, side: Side, m: Move) -> bool {
        let next = Rules::apply(position, m);
        if let Status::Checkmate(winner) = Rules::status(&next) {
            return winner == side;
        }
        !matches!(
            Threat::scan(&next, side).first(),
            Some(Threat::Mate { .. })
        )
    }

    /// defend a hanging piece: escape, then block sliding attackers,
    /// then capture. every candidate is simulated and re-checked.
    fn rescue(
        position: &Position,
        legal: &[Move],
        side: Side,
        square: Square,
        attackers: &[Square],
    ) -> Option<Move> {
        let (_, piece) = position.at(square)?;
        let escapes = legal.iter().filter(|m| m.from == square);
        for m in escapes {
            if Self::rescues(position, side, *m, m.to) {
                return Some(*m);
            }
        }
        for attacker in attackers {
            let (_, by) = position.at(*attacker)?;
            if by.slides() {
                for lane in Rules::between(*attacker, square) {
                    for m in legal.iter().filter(|m| m.to == lane && m.from != square) {
                        if Self::rescues(position, side, *m, square) {
                            return Some(*m);
                        }
                    }
                }
            }
        }
        for attacker in attackers {
            let (_, by) = position.at(*attacker)?;
            for m in legal.iter().filter(|m| m.to == *attacker) {
                let (_, capturer) = position.at(m.from)?;
                if by.value() >= capturer.value() || piece.value() > capturer.value() {
                    if Self::rescues(position, side, *m, square) {
                        return Some(*m);
                    }
                }
            }
        }
        None
    }

    /// the watched square holds no en-prise piece of ours once the
    /// candidate move is made
    fn rescues(position: &Position, side: Side, m: Move, watched: Square) -> bool {
        let next = Rules::apply(position, m);
        match next.at(watched) {
            Some((owner, piece)) if owner == side => {
                let attackers = Rules::attackers_of(&next, watched, side.flip());
                !Threat::en_prise(&next, watched, piece, side, &attackers)
            }
            _ => true,
        }
    }

    /// answer a fork, pin, skewer, or discovered line: take the tactical
    /// piece if that holds up, otherwise walk the dearest target out
    fn unravel(
        position: &Position,
        legal: &[Move],
        side: Side,
        attacker: Square,
        targets: &[Square],
    ) -> Option<Move> {
        for m in legal.iter().filter(|m| m.to == attacker) {
            if Self::rescues(position, side, *m, m.to) {
                return Some(*m);
            }
        }
        let mut targets = targets.to_vec();
        targets.sort_by(|a, b| {
            let value = |s: &Square| position.at(*s).map(|(_, p)| p.value()).unwrap_or(0.);
            value(b).partial_cmp(&value(a)).unwrap_or(std::cmp::Ordering::Equal)
        });
        for target in targets {
            for m in legal.iter().filter(|m| m.from == target) {
                if Self::rescues(position, side, *m, m.to) {
                    return Some(*m);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chess::Piece;

    fn position(fen: &str) -> Position {
        Position::from_fen(fen).expect("well formed test position")
    }

    #[test]
    fn blocks_scholars_mate_with_knight() {
        // 1. e4 e5 2. Bc4 Nc6 3. Qf3 and Black must stop Qxf7#
        let p = position("r1bqkbnr/pppp1ppp/2n5/4p3/2B1P3/5Q2/PPPP1PPP/RNB1K1NR b KQkq - 3 3");
        let legal = Rules::legal_moves(&p, Side::Black);
        let defense = Arbiter::best_defense(&p, &legal, Side::Black).expect("mate threat");
        assert!(defense.severity == Severity::Checkmate);
        assert!(defense.severity.rank() == 1000);
        assert!(defense.is_critical());
        assert!(defense.m == "g8f6".parse().expect("parse"));
    }

    #[test]
    fn mate_defense_verified_against_all_maters() {
        // back rank: Ra1 and Rb1 both mate on the 8th; only luft averts
        let p = position("6k1/5ppp/8/8/8/8/8/RR4K1 b - - 0 1");
        let legal = Rules::legal_moves(&p, Side::Black);
        let defense = Arbiter::best_defense(&p, &legal, Side::Black).expect("mate threat");
        let next = Rules::apply(&p, defense.m);
        assert!(!matches!(
            Threat::scan(&next, Side::Black).first(),
            Some(Threat::Mate { .. })
        ));
    }

    #[test]
    fn rescues_hanging_queen_by_escape() {
        let p = position("3q3k/8/8/8/8/8/8/3R3K b - - 0 1");
        let legal = Rules::legal_moves(&p, Side::Black);
        let defense = Arbiter::best_defense(&p, &legal, Side::Black).expect("queen hangs");
        assert!(defense.severity == Severity::MajorHanging);
        assert!(!defense.is_critical());
        let next = Rules::apply(&p, defense.m);
        // wherever she went, she is safe now
        let threats = Threat::scan(&next, Side::Black);
        assert!(!threats
            .iter()
            .any(|t| matches!(t, Threat::Hanging { piece: Piece::Queen, .. })));
    }

    #[test]
    fn capture_respects_value_discipline() {
        // black rook attacked by a defended white pawn: taking the pawn
        // loses the exchange, so the rook walks away instead
        let p = position("7k/8/8/8/2r5/1P6/P7/6K1 b - - 0 1");
        let legal = Rules::legal_moves(&p, Side::Black);
        let defense = Arbiter::best_defense(&p, &legal, Side::Black).expect("rook hangs");
        assert!(defense.severity == Severity::MajorHanging);
        assert!(defense.m.to != "b3".parse().expect("parse"));
        assert!(defense.m.from == "c4".parse().expect("parse"));
    }

    #[test]
    fn quiet_position_yields_none() {
        let p = Position::default();
        let legal = Rules::legal_moves(&p, Side::White);
        assert!(Arbiter::best_defense(&p, &legal, Side::White).is_none());
    }

    #[test]
    fn positional_pressure_stays_below_threshold() {
        // enemy queen stares at the king zone without a concrete threat
        let p = position("6k1/8/8/8/8/8/5q2/K7 w - - 0 1");
        let legal = Rules::legal_moves(&p, Side::White);
        let defense = Arbiter::best_defense(&p, &legal, Side::White);
        if let Some(defense) = defense {
            assert!(defense.severity.rank() >= THRESHOLD);
        }
    }
}
