/// Identifier of a machine (host) in the cluster.
pub type MachineId = u32;

/// Ordinal of a device on its machine.
pub type DeviceId = u32;

/// Rank of a participant within one device set (0-indexed).
pub type Rank = u32;

/// Identifier of a job (one training/inference program).
pub type JobId = u64;

/// Device memory alignment used when charging operand sizes against the
/// fusion threshold.
pub const DEVICE_ALIGN_BYTES: usize = 512;

/// Round `size` up to a multiple of [`DEVICE_ALIGN_BYTES`].
pub const fn aligned_size(size: usize) -> usize {
    size.div_ceil(DEVICE_ALIGN_BYTES) * DEVICE_ALIGN_BYTES
}

/// Element data types carried by collective operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    F32 = 0,
    F64 = 1,
    F16 = 2,
    BF16 = 3,
    I8 = 4,
    I32 = 5,
    I64 = 6,
    U8 = 7,
    U32 = 8,
    U64 = 9,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 | DataType::U32 => 4,
            DataType::F64 | DataType::I64 | DataType::U64 => 8,
            DataType::F16 | DataType::BF16 => 2,
            DataType::I8 | DataType::U8 => 1,
        }
    }

    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::F16 => "f16",
            DataType::BF16 => "bf16",
            DataType::I8 => "i8",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::U8 => "u8",
            DataType::U32 => "u32",
            DataType::U64 => "u64",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Reduction method applied by reducing collectives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// Element-wise sum across ranks.
    Sum,
    /// Element-wise product across ranks.
    Prod,
    /// Element-wise minimum across ranks.
    Min,
    /// Element-wise maximum across ranks.
    Max,
}

impl std::fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReduceOp::Sum => f.write_str("sum"),
            ReduceOp::Prod => f.write_str("prod"),
            ReduceOp::Min => f.write_str("min"),
            ReduceOp::Max => f.write_str("max"),
        }
    }
}

/// The collective primitive an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
    AllReduce,
    AllGather,
    ReduceScatter,
    Reduce,
    Broadcast,
}

impl OpType {
    pub const fn name(self) -> &'static str {
        match self {
            OpType::AllReduce => "all_reduce",
            OpType::AllGather => "all_gather",
            OpType::ReduceScatter => "reduce_scatter",
            OpType::Reduce => "reduce",
            OpType::Broadcast => "broadcast",
        }
    }

    /// Whether the primitive combines values and therefore needs a [`ReduceOp`].
    pub const fn is_reducing(self) -> bool {
        matches!(
            self,
            OpType::AllReduce | OpType::ReduceScatter | OpType::Reduce
        )
    }

    /// Whether the primitive has a distinguished root rank.
    pub const fn is_rooted(self) -> bool {
        matches!(self, OpType::Reduce | OpType::Broadcast)
    }
}

impl std::fmt::Display for OpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Tag selecting which backend executes an operation.
///
/// `Custom` leaves room for out-of-tree backends registered through the
/// same [`Backend`](crate::backend::Backend) interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackendKind {
    Nccl,
    Custom(u32),
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Nccl => f.write_str("nccl"),
            BackendKind::Custom(id) => write!(f, "custom-{id}"),
        }
    }
}
