//! VM creation and deletion

pub mod error;
pub mod payload;
pub mod pipeline;
pub mod request;

pub use error::ProvisionError;
pub use pipeline::{PipelineTimings, Plan, ProvisioningPipeline};
pub use request::{
    BatchResult, DeleteRequest, DeletionResult, ProvisioningRequest, ProvisioningResult, VmTarget,
    MAX_BATCH_COUNT,
};
