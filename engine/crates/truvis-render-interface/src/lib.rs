//! 渲染核心的公共边界
//!
//! 上层模块通过 [`handles::Handle`] 引用资源，资源本身保存在 [`resource_store::ResourceStore`] 中。

pub mod config;
pub mod errors;
pub mod frame_counter;
pub mod handles;
pub mod resource_store;
