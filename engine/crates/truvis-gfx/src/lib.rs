//! Truvis GFX 层
//!
//! 渲染核心只通过 [`device::GfxDevice`] 和 GPU 打交道：创建/销毁 buffer、image，
//! map 主机可见内存，录制并提交 command buffer，创建 semaphore / fence。
//!
//! - [`vulkan::VulkanDevice`]：基于 ash + vk-mem 的真实实现
//! - [`headless::HeadlessDevice`]：在 CPU 上模拟队列执行，用于测试和无 GPU 的环境
//!
//! 不再使用全局单例，所有上层模块都持有 `Arc<dyn GfxDevice>`。

pub mod commands;
pub mod device;
pub mod error;
pub mod headless;
pub mod resources;
pub mod vulkan;

pub use device::GfxDevice;
pub use error::{GfxError, GfxResult};
