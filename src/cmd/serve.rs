//! `capstone serve`.

use std::sync::Arc;

use anyhow::Result;
use capstone::config::CapstoneConfig;
use capstone::lifecycle::Orchestrator;

pub async fn cmd_serve(config: CapstoneConfig) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }
    let orchestrator = Arc::new(Orchestrator::from_config(config)?);
    capstone::server::start_server(orchestrator).await
}
