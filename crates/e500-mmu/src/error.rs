use thiserror::Error;

use crate::descriptor::SizeClass;
use crate::store::TableId;

pub type Result<T> = std::result::Result<T, TlbError>;

/// Rejections at the API boundary.
///
/// Misses, unbacked frames and full tables are not errors; they are reported
/// through the normal return values of the miss and mapping paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TlbError {
    #[error("slot {slot} out of range for {table} (size {size})")]
    SlotOutOfRange {
        table: TableId,
        slot: usize,
        size: usize,
    },

    #[error("{table} does not support {size:?} pages")]
    UnsupportedSize { table: TableId, size: SizeClass },

    #[error("all {capacity} protected slots are in use")]
    ProtectedRegionFull { capacity: usize },

    #[error("protected slot {index} out of range (capacity {capacity})")]
    ProtectedSlotOutOfRange { index: usize, capacity: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}
