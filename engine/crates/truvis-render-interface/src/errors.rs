use truvis_gfx::GfxError;

use crate::handles::{Handle, ResourceCategory};

/// 配置或使用方式错误，立即返回，不会重试
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigurationError {
    #[error("{category} store is full (capacity {capacity})")]
    CapacityExceeded { category: ResourceCategory, capacity: usize },

    #[error("handle {handle} is not registered or has been released")]
    HandleNotFound { handle: Handle },

    #[error("handle {handle} used with the {expected} store")]
    CategoryMismatch { handle: Handle, expected: ResourceCategory },

    #[error("frame in flight index {index} out of range (frames in flight: {frames_in_flight})")]
    InvalidFrameIndex { index: usize, frames_in_flight: usize },

    #[error("no queue available for {purpose}")]
    NoQueueAvailable { purpose: String },

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

/// 资源创建失败，只影响当前这一个请求
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResourceCreationError {
    #[error("failed to prepare `{name}`: {reason}")]
    Prep { name: String, reason: String },

    #[error("failed to create gpu objects for `{name}`: {source}")]
    Gpu {
        name: String,
        #[source]
        source: GfxError,
    },

    #[error("transfer worker stopped before `{name}` was executed")]
    WorkerStopped { name: String },

    #[error("no free upload context for `{name}`")]
    UploadContextExhausted { name: String },

    #[error("failed to spawn transfer thread `{name}`: {reason}")]
    WorkerSpawn { name: String, reason: String },

    /// 排队的更新在发送给 worker 时才发现和资源不匹配
    #[error("update of `{name}` rejected: {reason}")]
    UpdateRejected { name: String, reason: String },
}

/// 调用时机不对，属于上层的编程错误
#[derive(Debug, Clone, thiserror::Error)]
pub enum PreconditionError {
    #[error("resource {handle} is not ready")]
    NotReady { handle: Handle },

    #[error("update of {size} bytes does not fit into {handle} ({capacity} bytes)")]
    UpdateTooLarge { handle: Handle, size: u64, capacity: u64 },

    #[error("resource {handle} is not a {expected}")]
    RequestKindMismatch { handle: Handle, expected: &'static str },
}

/// 帧提交过程中的错误
#[derive(Debug, Clone, thiserror::Error)]
pub enum SubmissionError {
    #[error("[F{frame_id}] record callback of `{name}` failed: {reason}")]
    RecordFailed { frame_id: u64, name: String, reason: String },

    #[error("device error during submission: {0}")]
    Device(#[from] GfxError),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RenderCoreError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    ResourceCreation(#[from] ResourceCreationError),

    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error(transparent)]
    Submission(#[from] SubmissionError),

    #[error(transparent)]
    Gfx(#[from] GfxError),
}

pub type RenderResult<T> = Result<T, RenderCoreError>;
