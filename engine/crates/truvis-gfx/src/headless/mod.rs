//! 在 CPU 上模拟的 [`crate::GfxDevice`]
//!
//! 每个 queue 维护一个提交队列，提交时立即在调用线程上执行所有 wait 已满足的批次；
//! 被暂停的 queue family 不会执行任何批次，直到 `resume_family`。
//! 同时会记录所有提交以及违反 Vulkan 使用规则的操作，供测试检查。

mod device;
mod state;

pub use device::{HeadlessDevice, HeadlessObjectCounts, HeadlessSubmission};
