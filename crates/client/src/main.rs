//! Board-farm controller (cdba-client)
//!
//! Forks `ssh <host> <server-bin>` and speaks the wire protocol over its
//! stdio, driving one board session to completion.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cdba_client::cli::Cli;
use cdba_client::controller::Controller;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,cdba_client=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let controller = match Controller::spawn(&cli).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to connect to \"{}\": {e}", cli.host);
            std::process::exit(1);
        }
    };

    let code = controller.run().await;
    std::process::exit(code);
}
