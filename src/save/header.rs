use super::SaveError;
use crate::learner::Kind;
use byteorder::BE;
use byteorder::ReadBytesExt;
use byteorder::WriteBytesExt;
use std::io::Read;
use std::io::Write;

/// leading bytes of every checkpoint, before the learner-defined body:
/// four magic bytes, a schema version, and the learner kind tag.
pub const MAGIC: [u8; 4] = *b"LCKP";
pub const SCHEMA_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub schema: u16,
    pub kind: Kind,
}

impl Header {
    pub fn new(kind: Kind) -> Self {
        Self {
            schema: SCHEMA_VERSION,
            kind,
        }
    }

    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        w.write_all(&MAGIC)?;
        w.write_u16::<BE>(self.schema)?;
        w.write_u16::<BE>(self.kind.tag())?;
        Ok(())
    }

    /// garbage magic or tag is corruption; a sound header with another
    /// schema version is merely incompatible
    pub fn read(r: &mut dyn Read) -> Result<Self, SaveError> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)
            .map_err(|_| SaveError::Corrupt(Default::default()))?;
        if magic != MAGIC {
            return Err(SaveError::Corrupt(Default::default()));
        }
        let schema = r
            .read_u16::<BE>()
            .map_err(|_| SaveError::Corrupt(Default::default()))?;
        let tag = r
            .read_u16::<BE>()
            .map_err(|_| SaveError::Corrupt(Default::default()))?;
        let kind = Kind::from_tag(tag).ok_or(SaveError::Corrupt(Default::default()))?;
        if schema != SCHEMA_VERSION {
            return Err(SaveError::Incompatible {
                expected: SCHEMA_VERSION,
                found: schema,
            });
        }
        Ok(Self { schema, kind })
    }
}
