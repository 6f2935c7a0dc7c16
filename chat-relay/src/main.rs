use std::{io::IsTerminal, process::ExitCode};

use clap::Parser;
use tracing::{error, info};

use chat_relay::{
    cli::{Cli, ClientArgs, Command, ServerArgs},
    client,
    error::exit_status,
    relay::Relay,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stdout().is_terminal())
        .try_init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => run_server(args).await,
        Command::Client(args) => {
            let code = run_client(args).await;
            // Pending stdin reads would otherwise hold the runtime open on shutdown.
            std::process::exit(i32::from(code));
        }
    }
}

async fn run_server(args: ServerArgs) -> ExitCode {
    let relay = match Relay::bind(args.into_config()).await {
        Ok(relay) => relay,
        Err(err) => {
            error!(error = ?err, "{err}");
            return err.exit_code();
        }
    };

    match relay.local_addr() {
        Ok(addr) => info!("relay listening on {}", addr),
        Err(err) => {
            error!(error = ?err, "listener has no local address");
            return ExitCode::from(exit_status::STARTUP_ERROR);
        }
    }

    if let Err(err) = relay.run_until_ctrl_c().await {
        error!("relay exited with error: {err:?}");
        return ExitCode::from(exit_status::STARTUP_ERROR);
    }
    ExitCode::SUCCESS
}

async fn run_client(args: ClientArgs) -> u8 {
    let session = match client::connect(&args).await {
        Ok(session) => session,
        Err(err) => {
            error!("{err:#}");
            return exit_status::CONNECT_ERROR;
        }
    };

    if let Err(err) = client::run(session, args.log_file).await {
        error!("{err:#}");
        return exit_status::STARTUP_ERROR;
    }
    0
}
