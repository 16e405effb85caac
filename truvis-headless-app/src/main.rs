use truvis_headless_app::app::{AppArgs, HeadlessApp};

fn main() -> anyhow::Result<()> {
    truvis_crate_tools::init_log::init_log(log::LevelFilter::Info);

    let args = AppArgs::parse(std::env::args().skip(1))?;
    let mut app = HeadlessApp::new(&args)?;
    let result = app.run(args.frames);
    app.destroy();

    log::info!("end run.");
    result
}
