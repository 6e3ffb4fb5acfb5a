use crate::error::{GraphError, Result};

/// Dense vertex identifier assigned by the interner in first-seen order.
pub type VertexId = u32;
/// Monotonic edge identifier assigned by the loader.
pub type EdgeId = u32;
/// Dense label identifier; 0 is reserved as "unset".
pub type LabelId = u8;
/// Identifier of the fixed-width vertex partition owning a vertex.
pub type BlockId = u32;

/// Serialized size of one adjacency record.
pub const EDGE_RECORD_SIZE: usize = 12;

const DIRECTION_IN: u8 = 0;
const DIRECTION_OUT: u8 = 1;

/// Direction of an adjacency record relative to its owning vertex.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Direction {
    In = DIRECTION_IN,
    Out = DIRECTION_OUT,
}

impl Direction {
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            DIRECTION_IN => Ok(Self::In),
            DIRECTION_OUT => Ok(Self::Out),
            other => Err(GraphError::Corrupt {
                block_id: 0,
                reason: format!("unknown direction byte: 0x{other:02X}"),
            }),
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// One adjacency record, stored twice per logical edge: an out-record in
/// the source vertex's block and an in-record in the destination vertex's
/// block, both carrying the same `edge_id`.
///
/// `src_label`/`dst_label` always describe "this vertex, other vertex", so
/// the in-record carries them swapped relative to the input tuple.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EdgeRecord {
    pub edge_id: EdgeId,
    pub neighbor_id: VertexId,
    pub edge_label: LabelId,
    pub direction: u8,
    pub src_label: LabelId,
    pub dst_label: LabelId,
}

impl EdgeRecord {
    /// Appends the little-endian 12-byte image of this record.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.edge_id.to_le_bytes());
        out.extend_from_slice(&self.neighbor_id.to_le_bytes());
        out.push(self.edge_label);
        out.push(self.direction);
        out.push(self.src_label);
        out.push(self.dst_label);
    }

    /// Decodes one record from the first [`EDGE_RECORD_SIZE`] bytes.
    pub fn decode_from(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < EDGE_RECORD_SIZE {
            return Err(GraphError::Corrupt {
                block_id: 0,
                reason: "edge record truncated".into(),
            });
        }
        let edge_id = u32::from_le_bytes(bytes[0..4].try_into().expect("slice has 4 bytes"));
        let neighbor_id = u32::from_le_bytes(bytes[4..8].try_into().expect("slice has 4 bytes"));
        Direction::from_byte(bytes[9])?;
        Ok(Self {
            edge_id,
            neighbor_id,
            edge_label: bytes[8],
            direction: bytes[9],
            src_label: bytes[10],
            dst_label: bytes[11],
        })
    }
}
