//! 资源的创建与上传
//!
//! - [`transfer_request`]：描述一次上传，负责准备数据、创建 stage buffer 和最终资源、录制拷贝
//! - [`transfer_worker`]：后台线程，每个线程独占一个 transfer queue
//! - [`render_resource_manager`]：对外的入口，通过 Handle 管理 buffer、texture、semaphore、pipeline

mod records;
mod upload_context;

pub mod render_resource_manager;
pub mod transfer_request;
pub mod transfer_signal;
pub mod transfer_worker;

pub use records::ResourceStatus;
pub use render_resource_manager::{RenderResourceManager, ResourceStats};
pub use transfer_request::{BufferUpload, GpuResource, TextureSource, TextureUpload, TransferRecipe, TransferRequest};
pub use transfer_worker::TransferPriority;
