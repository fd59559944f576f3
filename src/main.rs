use std::process::ExitCode;

use clap::Parser;

use nnvmc::config::Config;
use nnvmc::train;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config.yml")]
    config: String,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let cfg = match Config::from_yaml_file(&args.config).and_then(|c| c.resolve()) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    match train::train(&cfg) {
        Ok(outcome) => {
            log::info!(
                "finished {} iterations, final energy {:.6} Ha",
                outcome.iterations,
                outcome.energy
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
