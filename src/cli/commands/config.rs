//! Implementation of the `callhook config` command.

use anyhow::{Context, Result};
use clap::Args;

use crate::domain::models::Config;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Print a single section (server, database, cache, tools, gateway, pricing, logging)
    #[arg(short, long)]
    pub section: Option<String>,
}

pub fn execute(args: ConfigArgs, config: &Config, json_mode: bool) -> Result<()> {
    let mut value = serde_json::to_value(config).context("Failed to serialize configuration")?;

    if let Some(section) = &args.section {
        value = value
            .get(section)
            .cloned()
            .with_context(|| format!("Unknown configuration section: {section}"))?;
    }

    if json_mode {
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        print!("{}", serde_yaml::to_string(&value)?);
    }
    Ok(())
}
