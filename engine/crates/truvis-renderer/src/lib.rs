//! 每帧的提交调度
//!
//! - [`command_buffer_request`]：注册到调度器的录制请求，按 queue type、phase、sub_order 排序
//! - [`command_buffer_manager`]：每帧录制并提交请求，group 之间用 binary semaphore 串联
//! - [`render_context`]：把 device、帧计数器、资源管理和提交调度组合在一起

pub mod command_buffer_manager;
pub mod command_buffer_request;
pub mod render_context;

pub use command_buffer_manager::{CommandBufferManager, SubmitStats};
pub use command_buffer_request::{CommandBufferRequest, QueueType, RecordCallback, SubmitMode, SubmitPhase};
pub use render_context::{FrameStats, RenderContext};
