//! 基于 ash + vk-mem 的 [`crate::GfxDevice`] 实现

mod device;
mod init;

pub use device::VulkanDevice;
