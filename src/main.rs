use clap::Parser;
use color_eyre::Result;

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    /// Log verbosity if RUST_LOG is unset (error, warn, info, debug, trace).
    #[clap(long, default_value = "warn")]
    log_level: String,
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(args.log_level)).init();

    webcard_host::run()?;
    Ok(())
}
