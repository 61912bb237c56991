use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::warn;

use chat_relay::{
    cli::{Cli, Command},
    client, server,
};

/// How long shutdown waits on blocking workers. A console read parked on
/// stdin cannot be cancelled, so it is abandoned after this.
const RUNTIME_SHUTDOWN: Duration = Duration::from_millis(200);

fn init_tracing() {
    use std::io::IsTerminal;

    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stdout().is_terminal())
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(run(cli.command));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN);
    result
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::Server(args) => {
            if let Err(err) = server::run(args).await {
                warn!("server exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
