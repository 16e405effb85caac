use ash::vk;

/// GFX 层的错误
///
/// 只描述设备层面发生了什么，是否致命由上层决定。
#[derive(Debug, Clone, thiserror::Error)]
pub enum GfxError {
    #[error("vulkan call failed: {0}")]
    Vulkan(#[from] vk::Result),

    #[error("failed to allocate `{name}`: {reason}")]
    AllocationFailed { name: String, reason: String },

    #[error("failed to map buffer 0x{raw:x}: {reason}")]
    MapFailed { raw: u64, reason: String },

    #[error("unknown {kind} 0x{raw:x}")]
    UnknownObject { kind: &'static str, raw: u64 },

    #[error("queue {queue_index} of family {family_index} is unavailable or already owned")]
    QueueUnavailable { family_index: u32, queue_index: u32 },

    #[error("failed to load vulkan: {0}")]
    Loader(String),

    #[error("invalid usage: {0}")]
    InvalidUsage(String),
}

pub type GfxResult<T> = Result<T, GfxError>;
