//! Greedy, order-preserving fusion of co-located requests.
//!
//! Requests are packed into contiguous runs: a run is closed as soon as the
//! next request is not fusable with its last member or would push the
//! aligned byte total past the threshold. Nothing is ever reordered.

use std::sync::Arc;

use crate::config::BoxingConfig;
use crate::plan::RequestDesc;
use crate::types::{OpType, aligned_size};

/// Fusion rules derived from [`BoxingConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FusionPolicy {
    pub threshold_bytes: usize,
    pub all_reduce: bool,
    pub all_gather: bool,
    pub reduce_scatter: bool,
    pub reduce: bool,
    pub broadcast: bool,
    pub all_reduce_use_buffer: bool,
}

impl FusionPolicy {
    pub fn from_config(cfg: &BoxingConfig) -> Self {
        Self {
            threshold_bytes: cfg.fusion_threshold_bytes,
            all_reduce: cfg.fusion_all_reduce,
            all_gather: cfg.fusion_all_gather,
            reduce_scatter: cfg.fusion_reduce_scatter,
            reduce: cfg.fusion_reduce,
            broadcast: cfg.fusion_broadcast,
            all_reduce_use_buffer: cfg.fusion_all_reduce_use_buffer,
        }
    }

    pub fn is_enabled(&self, op_type: OpType) -> bool {
        match op_type {
            OpType::AllReduce => self.all_reduce,
            OpType::AllGather => self.all_gather,
            OpType::ReduceScatter => self.reduce_scatter,
            OpType::Reduce => self.reduce,
            OpType::Broadcast => self.broadcast,
        }
    }

    /// Whether `rhs` may join a group whose last member is `lhs`.
    pub fn can_fuse(&self, lhs: &RequestDesc, rhs: &RequestDesc) -> bool {
        if lhs.device_set != rhs.device_set {
            return false;
        }
        let (l, r) = (&lhs.op_desc, &rhs.op_desc);
        if !self.is_enabled(l.op_type) || !self.is_enabled(r.op_type) {
            return false;
        }
        if l.op_type != r.op_type {
            return false;
        }
        match l.op_type {
            OpType::AllReduce if self.all_reduce_use_buffer => {
                l.reduce_method == r.reduce_method && l.data_type == r.data_type
            }
            _ => true,
        }
    }

    /// Bytes a request charges against the threshold.
    pub fn charged_size(request: &RequestDesc) -> usize {
        aligned_size(request.op_desc.size_in_bytes())
    }

    /// Pack `requests` into fusion groups.
    ///
    /// A single request larger than the threshold still forms its own group.
    pub fn group(&self, requests: &[Arc<RequestDesc>]) -> Vec<Vec<Arc<RequestDesc>>> {
        let mut groups = Vec::new();
        let mut group: Vec<Arc<RequestDesc>> = Vec::new();
        let mut group_size = 0usize;

        for request in requests {
            let size = Self::charged_size(request);
            let extends = group.last().is_some_and(|last| {
                self.can_fuse(last, request) && group_size + size <= self.threshold_bytes
            });
            if !extends && !group.is_empty() {
                groups.push(std::mem::take(&mut group));
                group_size = 0;
            }
            group.push(Arc::clone(request));
            group_size += size;
        }
        if !group.is_empty() {
            groups.push(group);
        }
        groups
    }
}

impl Default for FusionPolicy {
    fn default() -> Self {
        Self::from_config(&BoxingConfig::default())
    }
}
