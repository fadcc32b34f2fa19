use crate::chess::Move;
use crate::chess::Piece;
use crate::chess::Position;
use crate::chess::Rules;
use crate::chess::Side;
use crate::chess::Square;

/// severity ladder, descending. only threats at or above Tactical are
/// ever answered; Positional is observed but never acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Positional,
    Tactical,
    MinorHanging,
    MajorHanging,
    Checkmate,
}

impl Severity {
    pub fn rank(&self) -> u32 {
        match self {
            Self::Checkmate => 1000,
            Self::MajorHanging => 900,
            Self::MinorHanging => 500,
            Self::Tactical => 300,
            Self::Positional => 100,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Checkmate => write!(f, "CHECKMATE"),
            Self::MajorHanging => write!(f, "MAJOR_HANGING"),
            Self::MinorHanging => write!(f, "MINOR_HANGING"),
            Self::Tactical => write!(f, "TACTICAL"),
            Self::Positional => write!(f, "POSITIONAL"),
        }
    }
}

/// a concrete threat by the opponent against the protected side.
#[derive(Debug, Clone, PartialEq)]
pub enum Threat {
    /// the opponent, on the move, has at least one mating reply
    Mate { mating: Vec<Move> },
    /// a piece is attacked with insufficient defense
    Hanging {
        square: Square,
        piece: Piece,
        attackers: Vec<Square>,
    },
    /// a fork, pin, skewer, or discovered attack against high value material
    Pattern {
        attacker: Square,
        targets: Vec<Square>,
    },
    /// king-zone pressure, never answered
    Pressure { square: Square },
}

impl Threat {
    pub fn severity(&self) -> Severity {
        match self {
            Self::Mate { .. } => Severity::Checkmate,
            Self::Hanging { piece, .. } => match piece {
                Piece::Queen | Piece::Rook => Severity::MajorHanging,
                _ => Severity::MinorHanging,
            },
            Self::Pattern { .. } => Severity::Tactical,
            Self::Pressure { .. } => Severity::Positional,
        }
    }

    /// every threat against `side` in the current position, most severe
    /// first. detection is pure and consults only the rules oracle.
    pub fn scan(position: &Position, side: Side) -> Vec<Self> {
        let mut threats = Vec::new();
        threats.extend(Self::mates(position, side));
        threats.extend(Self::hanging(position, side));
        threats.extend(Self::patterns(position, side));
        threats.extend(Self::pressure(position, side));
        threats.sort_by(|a, b| b.severity().cmp(&a.severity()));
        threats
    }

    /// mating replies the opponent has, or would have if we passed
    fn mates(position: &Position, side: Side) -> Vec<Self> {
        let passed = match position.turn() {
            turn if turn == side => Rules::pass(position),
            _ => *position,
        };
        let mating = Rules::legal_moves(&passed, side.flip())
            .into_iter()
            .filter(|m| {
                matches!(
                    Rules::status(&Rules::apply(&passed, *m)),
                    crate::chess::Status::Checkmate(winner) if winner == side.flip()
                )
            })
            .collect::<Vec<_>>();
        if mating.is_empty() {
            Vec::new()
        } else {
            vec![Self::Mate { mating }]
        }
    }

    fn hanging(position: &Position, side: Side) -> Vec<Self> {
        position
            .army(side)
            .filter(|(_, piece)| *piece != Piece::King && *piece != Piece::Pawn)
            .filter_map(|(square, piece)| {
                let attackers = Rules::attackers_of(position, square, side.flip());
                if Self::en_prise(position, square, piece, side, &attackers) {
                    Some(Self::Hanging {
                        square,
                        piece,
                        attackers,
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    /// attacked, and either undefended or winnable by a cheaper attacker
    pub(super) fn en_prise(
        position: &Position,
        square: Square,
        piece: Piece,
        side: Side,
        attackers: &[Square],
    ) -> bool {
        if attackers.is_empty() {
            return false;
        }
        let defenders = Rules::attackers_of(position, square, side);
        let cheapest = attackers
            .iter()
            .filter_map(|a| position.at(*a))
            .map(|(_, p)| p.value())
            .fold(f32::INFINITY, f32::min);
        defenders.is_empty() || cheapest < piece.value()
    }

    fn patterns(position: &Position, side: Side) -> Vec<Self> {
        let mut threats = Vec::new();
        threats.extend(Self::forks(position, side));
        threats.extend(Self::alignments(position, side));
        threats
    }

    /// an enemy knight or pawn currently attacking two or more pieces
    /// worth a rook or better
    fn forks(position: &Position, side: Side) -> Vec<Self> {
        position
            .army(side.flip())
            .filter(|(_, piece)| matches!(piece, Piece::Knight | Piece::Pawn))
            .filter_map(|(attacker, _)| {
                let targets = position
                    .army(side)
                    .filter(|(_, p)| p.value() >= Piece::Rook.value())
                    .filter(|(s, _)| {
                        Rules::attackers_of(position, *s, side.flip()).contains(&attacker)
                    })
                    .map(|(s, _)| s)
                    .collect::<Vec<_>>();
                if targets.len() >= 2 {
                    Some(Self::Pattern { attacker, targets })
                } else {
                    None
                }
            })
            .collect()
    }

    /// pins, skewers, and discovered lines: an enemy slider aligned with
    /// high value material behind exactly one blocker
    fn alignments(position: &Position, side: Side) -> Vec<Self> {
        let mut threats = Vec::new();
        for (attacker, piece) in position.army(side.flip()) {
            if !piece.slides() {
                continue;
            }
            for (square, target) in position.army(side) {
                if target.value() < Piece::Rook.value() {
                    continue;
                }
                if !Self::aims(piece, attacker, square) {
                    continue;
                }
                let between = Rules::between(attacker, square);
                let blockers = between
                    .iter()
                    .filter(|s| position.at(**s).is_some())
                    .collect::<Vec<_>>();
                // exactly one blocker makes a pin, skewer, or discovery;
                // zero blockers is a direct attack the hanging scan owns
                if let [blocker] = blockers[..] {
                    let (owner, shield) = position.at(*blocker).expect("occupied");
                    let real = match owner {
                        // our blocker: pinned if it shields something dearer
                        s if s == side => shield.value() < target.value(),
                        // their blocker: moving it discovers the attack
                        _ => true,
                    };
                    if real {
                        threats.push(Self::Pattern {
                            attacker,
                            targets: vec![square],
                        });
                    }
                }
            }
        }
        threats
    }

    /// does this slider's movement pattern point along the attacker-target line
    fn aims(piece: Piece, from: Square, to: Square) -> bool {
        let straight = from.rank() == to.rank() || from.file() == to.file();
        let diagonal = from.rank().abs_diff(to.rank()) == from.file().abs_diff(to.file());
        match piece {
            Piece::Rook => straight,
            Piece::Bishop => diagonal,
            Piece::Queen => straight || diagonal,
            _ => false,
        }
    }

    /// squares around our king the opponent covers more than we do
    fn pressure(position: &Position, side: Side) -> Vec<Self> {
        let Some(king) = position.king(side) else {
            return Vec::new();
        };
        let mut threats = Vec::new();
        for dr in -1..=1i8 {
            for df in -1..=1i8 {
                if let Some(square) = king.shift(dr, df) {
                    let theirs = Rules::attackers_of(position, square, side.flip()).len();
                    let ours = Rules::attackers_of(position, square, side).len();
                    if theirs > ours {
                        threats.push(Self::Pressure { square });
                    }
                }
            }
        }
        threats
    }
}
