use std::env;
use std::io;
use std::process::ExitCode;

use agro_escrow::csv::{read_script, write_orders};
use agro_escrow::engine::Envelope;
use agro_escrow::{Config, Engine};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let mut args = env::args().skip(1);
    let Some(path) = args.next() else {
        eprintln!("usage: agro-escrow <script.csv> [config.yaml]");
        return ExitCode::FAILURE;
    };

    let config = match args.next() {
        Some(config_path) => Config::load(config_path),
        None => Config::from_env(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let directive = config.app.log_level.as_deref().unwrap_or("warn");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    if !path.ends_with(".csv") {
        warn!(path, "input file seems to not be a csv file");
    }

    let steps = match read_script(path) {
        Ok(steps) => steps,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let mut engine = Engine::new(config);
    let (sender, receiver) = tokio::sync::mpsc::channel(16);

    tokio::spawn(async move {
        for result in steps {
            match result {
                Ok(step) => {
                    if sender.send(Envelope::new(step.ctx, step.command)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    engine.run(ReceiverStream::new(receiver)).await;

    if let Err(e) = write_orders(io::stdout().lock(), &engine) {
        error!("failed to write orders: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
