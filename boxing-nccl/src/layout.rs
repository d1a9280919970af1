use std::sync::Arc;

use boxing::types::aligned_size;
use boxing::{DataType, RequestDesc};

/// Placement of a buffer-fused all-reduce group inside one scratch buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FusionLayout {
    /// Byte offset of each member, in group order. Every offset is
    /// device-aligned.
    pub offsets: Vec<usize>,
    /// Sum of the members' aligned sizes.
    pub total_bytes: usize,
}

impl FusionLayout {
    pub fn for_group(group: &[Arc<RequestDesc>]) -> Self {
        let mut offsets = Vec::with_capacity(group.len());
        let mut total_bytes = 0usize;
        for request in group {
            offsets.push(total_bytes);
            total_bytes += aligned_size(request.op_desc.size_in_bytes());
        }
        Self {
            offsets,
            total_bytes,
        }
    }

    /// Whether the whole group fits a scratch buffer of `capacity` bytes.
    pub fn fits(&self, capacity: usize) -> bool {
        self.total_bytes <= capacity
    }

    /// Element count of the single in-place all-reduce over the buffer.
    /// Padding is reduced along with the payload.
    pub fn elem_count(&self, dtype: DataType) -> usize {
        self.total_bytes / dtype.size_in_bytes()
    }
}
