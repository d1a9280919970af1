pub mod backend;
pub mod comm;
pub mod device;
pub mod error;
pub mod layout;
pub mod types;

pub use backend::NcclBackend;
pub use comm::{UNIQUE_ID_BYTES, generate_unique_id, id_from_bytes, id_to_bytes};
pub use error::{NcclBackendError, Result};
pub use layout::FusionLayout;
pub use types::{launch_count, to_nccl_dtype, to_nccl_op};
