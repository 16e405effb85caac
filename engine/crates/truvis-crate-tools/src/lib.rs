pub mod init_log;
pub mod profile;

// 宏内部通过 `$crate::__tracy` 访问，调用方无需直接依赖 tracy-client
#[doc(hidden)]
pub use tracy_client as __tracy;
