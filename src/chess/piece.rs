use crate::Arbitrary;

/// one of the two armies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Side {
    White,
    Black,
}

impl Side {
    pub fn flip(&self) -> Self {
        match self {
            Self::White => Self::Black,
            Self::Black => Self::White,
        }
    }
    /// direction pawns of this side advance along the rank axis
    pub fn forward(&self) -> i8 {
        match self {
            Self::White => 1,
            Self::Black => -1,
        }
    }
    /// sign applied to piece values in the flat tensor encoding
    pub fn sign(&self) -> f32 {
        match self {
            Self::White => 1.,
            Self::Black => -1.,
        }
    }
    pub fn index(&self) -> usize {
        match self {
            Self::White => 0,
            Self::Black => 1,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::White => write!(f, "w"),
            Self::Black => write!(f, "b"),
        }
    }
}

/// the six piece kinds, uncolored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Piece {
    King,
    Queen,
    Rook,
    Bishop,
    Knight,
    Pawn,
}

impl Piece {
    pub const ALL: [Self; 6] = [
        Self::King,
        Self::Queen,
        Self::Rook,
        Self::Bishop,
        Self::Knight,
        Self::Pawn,
    ];
    /// material value on the K=10 Q=9 R=5 B=N=3 P=1 scale
    pub fn value(&self) -> f32 {
        match self {
            Self::King => 10.,
            Self::Queen => 9.,
            Self::Rook => 5.,
            Self::Bishop => 3.,
            Self::Knight => 3.,
            Self::Pawn => 1.,
        }
    }
    pub fn index(&self) -> usize {
        match self {
            Self::King => 0,
            Self::Queen => 1,
            Self::Rook => 2,
            Self::Bishop => 3,
            Self::Knight => 4,
            Self::Pawn => 5,
        }
    }
    pub fn slides(&self) -> bool {
        matches!(self, Self::Queen | Self::Rook | Self::Bishop)
    }
    fn letter(&self) -> char {
        match self {
            Self::King => 'k',
            Self::Queen => 'q',
            Self::Rook => 'r',
            Self::Bishop => 'b',
            Self::Knight => 'n',
            Self::Pawn => 'p',
        }
    }
    /// FEN letter, uppercase for White
    pub fn fen(&self, side: Side) -> char {
        match side {
            Side::White => self.letter().to_ascii_uppercase(),
            Side::Black => self.letter(),
        }
    }
}

impl TryFrom<char> for Piece {
    type Error = ();
    fn try_from(c: char) -> Result<Self, Self::Error> {
        match c.to_ascii_lowercase() {
            'k' => Ok(Self::King),
            'q' => Ok(Self::Queen),
            'r' => Ok(Self::Rook),
            'b' => Ok(Self::Bishop),
            'n' => Ok(Self::Knight),
            'p' => Ok(Self::Pawn),
            _ => Err(()),
        }
    }
}

impl Arbitrary for Piece {
    fn random() -> Self {
        use rand::seq::IndexedRandom;
        *Self::ALL.choose(&mut rand::rng()).expect("nonempty")
    }
}
