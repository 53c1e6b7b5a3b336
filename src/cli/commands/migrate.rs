//! Implementation of the `callhook migrate` command.

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;

use crate::adapters::sqlite::{all_embedded_migrations, open_pool, AppliedMigration, Migrator};
use crate::cli::output::{output, CommandOutput};
use crate::domain::models::Config;

#[derive(Args, Debug)]
pub struct MigrateArgs {
    /// Database path (overrides database.path)
    #[arg(long)]
    pub database: Option<String>,

    /// Only report the schema history, apply nothing
    #[arg(long)]
    pub status: bool,
}

#[derive(Debug, Serialize)]
pub struct MigrateOutput {
    pub database: String,
    pub applied_now: usize,
    pub history: Vec<AppliedMigration>,
}

impl CommandOutput for MigrateOutput {
    fn to_human(&self) -> String {
        let version = self.history.last().map_or(0, |m| m.version);
        let mut lines = vec![if self.applied_now == 0 {
            format!("{} is at schema version {version}", self.database)
        } else {
            format!(
                "Applied {} migration(s) to {}, now at schema version {version}",
                self.applied_now, self.database
            )
        }];
        lines.extend(
            self.history
                .iter()
                .map(|m| format!("  {:>3}  {}  {}", m.version, m.applied_at, m.description)),
        );
        lines.join("\n")
    }
}

pub async fn execute(args: MigrateArgs, mut config: Config, json_mode: bool) -> Result<()> {
    if let Some(path) = args.database {
        config.database.path = path;
    }

    let pool = open_pool(&config.database)
        .await
        .context("Failed to open database")?;
    let migrator = Migrator::new(pool.clone());

    let applied_now = if args.status {
        0
    } else {
        migrator
            .run_embedded_migrations(all_embedded_migrations())
            .await
            .context("Failed to apply migrations")?
    };
    let history = migrator.applied().await?;
    pool.close().await;

    output(
        &MigrateOutput {
            database: config.database.path,
            applied_now,
            history,
        },
        json_mode,
    );
    Ok(())
}
