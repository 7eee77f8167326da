use crate::services::subscription;
use crate::{Config, Database};
use anyhow::Result;
use std::path::Path;

use super::WebhookCommand;

pub async fn run(config_path: &Path, command: WebhookCommand) -> Result<()> {
    let config = Config::load(config_path)?;
    let db = Database::open_with_pool_size(&config.database.path, config.database.pool_size)?;
    db.migrate()?;

    match command {
        WebhookCommand::Add {
            tenant,
            name,
            url,
            events,
        } => {
            let (secret, sub) = subscription::create_subscription(&db, tenant, &name, &url, &events[..])?;
            println!("Webhook '{}' created: {}", sub.name, sub.id);
            println!("Signing secret (shown once): {}", secret);
        }
        WebhookCommand::List { tenant } => {
            let subs = subscription::list_subscriptions(&db, tenant)?;

            println!(
                "{:<38} {:<20} {:<8} {:<40} {}",
                "ID", "NAME", "ENABLED", "URL", "EVENTS"
            );
            println!("{}", "-".repeat(120));
            for sub in subs {
                println!(
                    "{:<38} {:<20} {:<8} {:<40} {}",
                    sub.id,
                    sub.name,
                    if sub.enabled { "yes" } else { "no" },
                    sub.url,
                    sub.events
                );
            }
        }
        WebhookCommand::Enable { id } => set_enabled(&db, id, true)?,
        WebhookCommand::Disable { id } => set_enabled(&db, id, false)?,
        WebhookCommand::RotateSecret { id } => match subscription::rotate_secret(&db, id)? {
            Some(secret) => println!("New signing secret (shown once): {}", secret),
            None => anyhow::bail!("Webhook {} not found", id),
        },
        WebhookCommand::Remove { id } => {
            if subscription::delete_subscription(&db, id)? {
                tracing::info!("Webhook {} removed", id);
            } else {
                tracing::warn!("Webhook {} not found", id);
            }
        }
    }

    Ok(())
}

fn set_enabled(db: &Database, id: uuid::Uuid, enabled: bool) -> Result<()> {
    if !subscription::set_enabled(db, id, enabled)? {
        anyhow::bail!("Webhook {} not found", id);
    }
    tracing::info!(
        "Webhook {} {}",
        id,
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}
