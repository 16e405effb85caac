/// 创建一个 tracy 的 profile span
///
/// 只有在 tracy client 已经启动时才会真正创建 span，否则返回 `None`，
/// 因此在单元测试、headless 工具中也可以放心使用。
///
/// ```ignore
/// let _span = truvis_crate_tools::profile_span!("TransferWorker::execute");
/// ```
#[macro_export]
macro_rules! profile_span {
    ($name:expr) => {
        $crate::__tracy::Client::running().map(|client| client.span($crate::__tracy::span_location!($name), 0))
    };
}
