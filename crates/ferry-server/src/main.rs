//! Ferry CI scheduling server.

mod cli;
mod server;
mod telemetry;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use ferry_scheduler::SchedulerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    telemetry::init(cli.log_format);

    match cli.command {
        Commands::Run { config, in_memory } => {
            let config = SchedulerConfig::load(config.as_deref())?;
            server::run(config, in_memory).await
        }
        Commands::Config { config } => {
            let config = SchedulerConfig::load(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Schema => {
            let mut schemas = serde_json::Map::new();
            for (name, schema) in ferry_core::schema::wire_schemas() {
                schemas.insert(name.to_string(), serde_json::to_value(schema)?);
            }
            println!("{}", serde_json::to_string_pretty(&schemas)?);
            Ok(())
        }
    }
}
