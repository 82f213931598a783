use clap::Parser;
use relaybar::{logging, run, CliArgs};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    if let Err(e) = logging::init() {
        eprintln!("{}", e);
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "relaybar stopped");
            eprintln!("{}", e.user_message());
            ExitCode::FAILURE
        }
    }
}
