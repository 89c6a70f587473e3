use std::process::ExitCode;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use wingman_server::config::{apply_cli_args, Settings};

fn usage() {
    eprintln!("usage: wingman-server [--port N] [--websocket-port N] [--gpu-layers N]");
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut settings = Settings::from_env();
    if let Err(err) = apply_cli_args(&mut settings, std::env::args().skip(1)) {
        eprintln!("{err}");
        usage();
        return ExitCode::from(2);
    }

    match wingman_server::run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
