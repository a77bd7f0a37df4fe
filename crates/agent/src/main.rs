//! Board-farm control agent (cdba-agent)
//!
//! Spoken to over stdin/stdout by a single controller for the lifetime of
//! the process — conventionally the far end of an `ssh` session that ran
//! this binary as the remote command. Loads the board inventory, then
//! drives the wire protocol until the transport closes.

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use cdba_agent::device::load_inventory;
use cdba_agent::dispatcher::Agent;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,cdba_agent=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("cdba-agent starting, version {}", env!("CARGO_PKG_VERSION"));

    let boards = load_inventory().context("loading board inventory")?;
    tracing::debug!(count = boards.len(), "loaded board inventory");

    let agent = Agent::new(tokio::io::stdin(), tokio::io::stdout(), boards);
    agent.run().await
}
