mod live;
mod offline;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 && args[1] == "--offline" {
        offline::run_scenarios()
    } else {
        live::run_circling_tone()
    }
}
