use clap::Parser;
use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use corebridge::{doctor, host, init_logging, AppEnv, Bridge, BridgeConfig, LocalBus};

mod cli;

use cli::{Cli, Command};

fn main() -> ExitCode {
    // Best-effort: a missing .env is normal.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let env = match AppEnv::detect(std::env::args().skip(1), cli.base_dir.clone()) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("corebridge: cannot determine environment: {e}");
            return ExitCode::from(1);
        }
    };
    let config_path = cli.config_path(&env.base_path);
    let config = match BridgeConfig::load(Some(&config_path)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("corebridge: {}: {e}", config_path.display());
            return ExitCode::from(1);
        }
    };

    match cli.command.clone().unwrap_or(Command::Serve) {
        Command::Doctor => {
            doctor::run_doctor(&env, &config, Some(&config_path), cli.verbose);
            ExitCode::from(0)
        }
        Command::Serve => {
            tracing::info!(
                base = %env.base_path.display(),
                tasksch = env.from_task_scheduler,
                "corebridge v{} serving on stdio",
                env!("CARGO_PKG_VERSION")
            );
            let (bus, outbox) = LocalBus::new();
            let bridge = match Bridge::new(bus.clone(), env, config) {
                Ok(b) => Arc::new(b),
                Err(e) => {
                    tracing::error!("startup failed: {e}");
                    return ExitCode::from(1);
                }
            };
            let stdin = io::stdin();
            let result = host::serve(bridge.clone(), bus, outbox, stdin.lock(), io::stdout());
            bridge.servers().stop_all();
            match result {
                Ok(()) => ExitCode::from(0),
                Err(e) => {
                    tracing::error!("stdio transport failed: {e}");
                    ExitCode::from(1)
                }
            }
        }
    }
}
