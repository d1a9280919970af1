//! Runtime-configurable tuning parameters for the scheduler and backends.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `BOXING_`) or by constructing a custom `BoxingConfig`.

use std::time::Duration;

use crate::error::{BoxingError, Result};

/// Scheduling, fusion and backend tuning.
#[derive(Debug, Clone)]
pub struct BoxingConfig {
    /// Number of communicator/stream sets per device set. Groups are spread
    /// across them round-robin.
    pub num_streams: usize,

    /// Upper bound on the aligned byte size of a fused group, and the size
    /// of each fusion scratch buffer.
    pub fusion_threshold_bytes: usize,

    /// Master switch. When off every request forms its own group.
    pub enable_fusion: bool,

    pub fusion_all_reduce: bool,
    pub fusion_all_gather: bool,
    pub fusion_reduce_scatter: bool,
    pub fusion_reduce: bool,
    pub fusion_broadcast: bool,

    /// Fuse all-reduces through one contiguous scratch buffer per device
    /// instead of batching per-request launches.
    pub fusion_all_reduce_use_buffer: bool,

    /// Dump the static schedule at startup.
    pub enable_debug_mode: bool,

    /// How long a non-root machine waits for a communicator handle.
    pub rendezvous_timeout: Duration,
}

impl Default for BoxingConfig {
    fn default() -> Self {
        Self {
            num_streams: 1,
            fusion_threshold_bytes: 16 * 1024 * 1024, // 16 MiB
            enable_fusion: true,
            fusion_all_reduce: true,
            fusion_all_gather: true,
            fusion_reduce_scatter: true,
            fusion_reduce: true,
            fusion_broadcast: true,
            fusion_all_reduce_use_buffer: false,
            enable_debug_mode: false,
            rendezvous_timeout: Duration::from_secs(300),
        }
    }
}

impl BoxingConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `BOXING_NUM_STREAMS`
    /// - `BOXING_FUSION_THRESHOLD_MB`
    /// - `BOXING_ENABLE_FUSION`
    /// - `BOXING_FUSION_ALL_REDUCE`, `BOXING_FUSION_ALL_GATHER`,
    ///   `BOXING_FUSION_REDUCE_SCATTER`, `BOXING_FUSION_REDUCE`,
    ///   `BOXING_FUSION_BROADCAST`
    /// - `BOXING_FUSION_ALL_REDUCE_USE_BUFFER`
    /// - `BOXING_DEBUG`
    /// - `BOXING_RENDEZVOUS_TIMEOUT_SECS`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(n) = lookup("BOXING_NUM_STREAMS").and_then(|v| v.parse::<usize>().ok()) {
            cfg.num_streams = n;
        }
        if let Some(mb) = lookup("BOXING_FUSION_THRESHOLD_MB").and_then(|v| v.parse::<usize>().ok())
        {
            cfg.fusion_threshold_bytes = mb * 1024 * 1024;
        }
        if let Some(secs) =
            lookup("BOXING_RENDEZVOUS_TIMEOUT_SECS").and_then(|v| v.parse::<u64>().ok())
        {
            cfg.rendezvous_timeout = Duration::from_secs(secs);
        }

        let flags: [(&str, &mut bool); 8] = [
            ("BOXING_ENABLE_FUSION", &mut cfg.enable_fusion),
            ("BOXING_FUSION_ALL_REDUCE", &mut cfg.fusion_all_reduce),
            ("BOXING_FUSION_ALL_GATHER", &mut cfg.fusion_all_gather),
            ("BOXING_FUSION_REDUCE_SCATTER", &mut cfg.fusion_reduce_scatter),
            ("BOXING_FUSION_REDUCE", &mut cfg.fusion_reduce),
            ("BOXING_FUSION_BROADCAST", &mut cfg.fusion_broadcast),
            (
                "BOXING_FUSION_ALL_REDUCE_USE_BUFFER",
                &mut cfg.fusion_all_reduce_use_buffer,
            ),
            ("BOXING_DEBUG", &mut cfg.enable_debug_mode),
        ];
        for (key, slot) in flags {
            if let Some(b) = lookup(key).and_then(|v| parse_flag(&v)) {
                *slot = b;
            }
        }

        cfg
    }

    /// Reject settings the backends cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.num_streams == 0 {
            return Err(BoxingError::Config("num_streams must be positive".into()));
        }
        Ok(())
    }
}

fn parse_flag(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
