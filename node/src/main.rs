use log::LevelFilter;
use peerprobe_node::{LoopbackNetwork, Orchestrator, SystemClock, TestConfig};
use std::fs::File;
use std::io;
use std::process::ExitCode;
use std::sync::Arc;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match TestConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("peerprobe: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&config) {
        eprintln!("peerprobe: cannot open log file: {e}");
        return ExitCode::FAILURE;
    }

    log::info!(
        "Starting protocol test against relay {}:{}",
        config.relay_address,
        config.relay_port
    );

    let mut orchestrator = Orchestrator::new(
        config,
        Arc::new(LoopbackNetwork::new()),
        Arc::new(SystemClock),
        Box::new(io::stdout()),
    );

    if orchestrator.run_tests().await.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn init_logging(config: &TestConfig) -> io::Result<()> {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level.as_str()),
    );
    if config.verbose {
        builder.filter_level(LevelFilter::Debug);
    }
    if let Some(path) = &config.log_file {
        let file = File::create(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}
