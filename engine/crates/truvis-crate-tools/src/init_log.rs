use std::io::Write;

/// 初始化全局 logger
///
/// - 默认过滤级别由 `default_filter` 指定，`RUST_LOG` 环境变量可以覆盖
/// - 输出格式：带颜色的 level + 时间 + 线程名，第二行是源码位置
///
/// 重复调用是安全的：只有第一次调用会生效。
pub fn init_log(default_filter: log::LevelFilter) {
    let mut builder = env_logger::Builder::new();
    builder
        .format(|buf, record| {
            let level_style = match record.level() {
                log::Level::Info => buf
                    .default_level_style(log::Level::Info)
                    .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Green))),
                log::Level::Warn => buf
                    .default_level_style(log::Level::Warn)
                    .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Yellow))),
                log::Level::Error => buf
                    .default_level_style(log::Level::Error)
                    .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Red))),
                level => buf.default_level_style(level),
            };
            let grey_style =
                anstyle::Style::new().fg_color(Some(anstyle::Color::Rgb(anstyle::RgbColor(110, 110, 110))));

            let time = chrono::Local::now().format("%Y/%m/%d %H:%M:%S%.3f");
            let thread = std::thread::current();
            let thread_name = thread.name().unwrap_or("unnamed");
            let file = record.file().unwrap_or("").rsplit(['/', '\\']).next().unwrap_or("");
            let line = record.line().unwrap_or(0);

            writeln!(
                buf,
                "{level_style}[{time}] {} [{thread_name}]: {}{level_style:#}\n\t {grey_style}At {file}:{line}{grey_style:#}",
                record.level(),
                record.args()
            )
        })
        .filter(None, default_filter);

    // RUST_LOG 优先级更高
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }

    let _ = builder.try_init();
}

/// 单元测试使用的 logger：输出交给 test harness 捕获
pub fn init_test_log() {
    let _ = env_logger::Builder::new().is_test(true).filter(None, log::LevelFilter::Debug).try_init();
}
