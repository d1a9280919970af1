use boxing::{DataType, OpDesc, OpType, ReduceOp};
use cudarc::nccl::sys;

use crate::error::{NcclBackendError, Result};

/// Convert a boxing DataType to the NCCL data type.
pub fn to_nccl_dtype(dt: DataType) -> sys::ncclDataType_t {
    match dt {
        DataType::F32 => sys::ncclDataType_t::ncclFloat32,
        DataType::F64 => sys::ncclDataType_t::ncclFloat64,
        DataType::F16 => sys::ncclDataType_t::ncclFloat16,
        DataType::BF16 => sys::ncclDataType_t::ncclBfloat16,
        DataType::I8 => sys::ncclDataType_t::ncclInt8,
        DataType::I32 => sys::ncclDataType_t::ncclInt32,
        DataType::I64 => sys::ncclDataType_t::ncclInt64,
        DataType::U8 => sys::ncclDataType_t::ncclUint8,
        DataType::U32 => sys::ncclDataType_t::ncclUint32,
        DataType::U64 => sys::ncclDataType_t::ncclUint64,
    }
}

/// Convert a boxing ReduceOp to the NCCL reduce operation.
pub fn to_nccl_op(op: ReduceOp) -> sys::ncclRedOp_t {
    match op {
        ReduceOp::Sum => sys::ncclRedOp_t::ncclSum,
        ReduceOp::Prod => sys::ncclRedOp_t::ncclProd,
        ReduceOp::Min => sys::ncclRedOp_t::ncclMin,
        ReduceOp::Max => sys::ncclRedOp_t::ncclMax,
    }
}

/// Element count passed to the NCCL primitive for `op`.
///
/// `shape` always describes the full tensor: all-gather sends and
/// reduce-scatter receives one `num_ranks`-th of it.
pub fn launch_count(op: &OpDesc) -> Result<usize> {
    let elems = op.elem_count();
    match op.op_type {
        OpType::AllGather | OpType::ReduceScatter => {
            let ranks = op.num_ranks as usize;
            if ranks == 0 || elems % ranks != 0 {
                return Err(launch_error(
                    op,
                    format!("{elems} elements not divisible by {ranks} ranks"),
                ));
            }
            Ok(elems / ranks)
        }
        OpType::AllReduce | OpType::Reduce | OpType::Broadcast => Ok(elems),
    }
}

pub(crate) fn reduce_op(op: &OpDesc) -> Result<sys::ncclRedOp_t> {
    op.reduce_method
        .map(to_nccl_op)
        .ok_or_else(|| launch_error(op, "missing reduce method"))
}

pub(crate) fn root(op: &OpDesc) -> Result<i32> {
    op.root
        .map(|r| r as i32)
        .ok_or_else(|| launch_error(op, "missing root"))
}

fn launch_error(op: &OpDesc, reason: impl Into<String>) -> NcclBackendError {
    NcclBackendError::Launch {
        name: op.name.clone(),
        op_type: op.op_type,
        reason: reason.into(),
    }
}
