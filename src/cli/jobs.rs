use crate::models::JobStatus;
use crate::services::queue;
use crate::{Config, Database};
use anyhow::Result;
use chrono::{TimeDelta, Utc};
use std::path::Path;

use super::JobsCommand;

pub async fn run(config_path: &Path, command: JobsCommand) -> Result<()> {
    let config = Config::load(config_path)?;
    let db = Database::open_with_pool_size(&config.database.path, config.database.pool_size)?;
    db.migrate()?;

    match command {
        JobsCommand::List { status, limit } => {
            let status = status
                .map(|s| {
                    JobStatus::from_str(&s)
                        .ok_or_else(|| anyhow::anyhow!("Unknown job status '{}'", s))
                })
                .transpose()?;
            let jobs = queue::list_jobs(&db, status, limit)?;

            println!(
                "{:<38} {:<20} {:<10} {:<9} {:<25} {}",
                "ID", "EVENT", "STATUS", "ATTEMPTS", "NEXT RETRY", "LAST ERROR"
            );
            println!("{}", "-".repeat(130));
            for job in jobs {
                println!(
                    "{:<38} {:<20} {:<10} {:<9} {:<25} {}",
                    job.id,
                    job.event_type,
                    job.status.as_str(),
                    format!("{}/{}", job.attempts, job.max_attempts),
                    job.next_retry_at
                        .map(crate::db::timestamp)
                        .unwrap_or_else(|| "-".to_string()),
                    job.last_error.unwrap_or_default()
                );
            }
        }
        JobsCommand::Prune { older_than_days } => {
            let cutoff = Utc::now() - TimeDelta::days(i64::from(older_than_days));
            let deleted = queue::prune_terminal(&db, cutoff)?;
            println!("Pruned {} delivered or failed job(s)", deleted);
        }
    }

    Ok(())
}
