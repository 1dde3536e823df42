//! Implementation of the `admin` subcommand: consumer provisioning and
//! database maintenance. These operate directly on the store rather than
//! through the API.

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use clap::Subcommand;
use uuid::Uuid;

use crate::auth;
use crate::config::Config;
use crate::db::Consumer;
use crate::db::Database;
use crate::db::NewConsumer;
use crate::db::SqliteDatabase;
use crate::db::database_file;

/// Arguments to the `admin` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// The administrative action to run.
    #[command(subcommand)]
    pub command: AdminCommands,
}

/// Administrative actions.
#[derive(Subcommand, Debug)]
pub enum AdminCommands {
    /// Provision a new consumer and print its token (shown exactly once).
    CreateConsumer {
        /// Unique consumer name.
        #[arg(long)]
        name: String,
        /// Maximum concurrently running jobs.
        #[arg(long, default_value_t = 1)]
        max_concurrent: i64,
        /// Maximum jobs per rolling 24 hours.
        #[arg(long, default_value_t = 100)]
        max_per_day: i64,
    },

    /// List all consumers.
    ListConsumers,

    /// Re-enable a consumer.
    EnableConsumer {
        /// Consumer id.
        #[arg(long)]
        id: Option<Uuid>,
        /// Consumer name.
        #[arg(long)]
        name: Option<String>,
    },

    /// Disable a consumer; it can no longer authenticate or submit.
    DisableConsumer {
        /// Consumer id.
        #[arg(long)]
        id: Option<Uuid>,
        /// Consumer name.
        #[arg(long)]
        name: Option<String>,
    },

    /// Update a consumer's quotas.
    SetQuota {
        /// Consumer id.
        #[arg(long)]
        id: Option<Uuid>,
        /// Consumer name.
        #[arg(long)]
        name: Option<String>,
        /// Maximum concurrently running jobs.
        #[arg(long)]
        max_concurrent: Option<i64>,
        /// Maximum jobs per rolling 24 hours.
        #[arg(long)]
        max_per_day: Option<i64>,
    },

    /// Rotate a consumer's credential and print the new token (shown
    /// exactly once).
    RotateKey {
        /// Consumer id.
        #[arg(long)]
        id: Option<Uuid>,
        /// Consumer name.
        #[arg(long)]
        name: Option<String>,
    },

    /// Delete a consumer along with all of its jobs and logs.
    DeleteConsumer {
        /// Consumer id.
        #[arg(long)]
        id: Option<Uuid>,
        /// Consumer name.
        #[arg(long)]
        name: Option<String>,
        /// Confirm the deletion.
        #[arg(long)]
        yes: bool,
    },

    /// Delete the database file and re-create an empty schema.
    ResetDb {
        /// Confirm the reset.
        #[arg(long)]
        yes: bool,
    },

    /// Print the resolved database location.
    DbInfo,
}

/// The main function for the `admin` subcommand.
pub async fn admin(args: Args, config: Config) -> Result<()> {
    match args.command {
        AdminCommands::CreateConsumer {
            name,
            max_concurrent,
            max_per_day,
        } => {
            if max_concurrent < 1 || max_per_day < 1 {
                bail!("quotas must be at least 1");
            }

            let db = open(&config).await?;
            let key_id = auth::generate_key_id();
            let token = format!("{key_id}.{}", auth::generate_secret());
            let hash = auth::hash_token(&token);

            let consumer = db
                .create_consumer(NewConsumer {
                    name,
                    key_id,
                    key_salt: hash.salt,
                    key_digest: hash.digest,
                    max_concurrent_jobs: max_concurrent,
                    max_jobs_per_day: max_per_day,
                })
                .await?;

            println!("consumer_id: {}", consumer.id);
            println!("consumer_name: {}", consumer.name);
            println!("consumer_key: {token}");
        }
        AdminCommands::ListConsumers => {
            let db = open(&config).await?;
            let consumers = db.list_consumers().await?;
            if consumers.is_empty() {
                println!("(no consumers)");
                return Ok(());
            }
            for c in consumers {
                println!(
                    "id={} name={} active={} max_concurrent={} max_per_day={}",
                    c.id, c.name, c.active, c.max_concurrent_jobs, c.max_jobs_per_day
                );
            }
        }
        AdminCommands::EnableConsumer { id, name } => {
            let db = open(&config).await?;
            let consumer = select_consumer(&db, id, name).await?;
            db.set_consumer_active(consumer.id, true).await?;
            println!("ok");
        }
        AdminCommands::DisableConsumer { id, name } => {
            let db = open(&config).await?;
            let consumer = select_consumer(&db, id, name).await?;
            db.set_consumer_active(consumer.id, false).await?;
            println!("ok");
        }
        AdminCommands::SetQuota {
            id,
            name,
            max_concurrent,
            max_per_day,
        } => {
            if max_concurrent.is_some_and(|v| v < 1) || max_per_day.is_some_and(|v| v < 1) {
                bail!("quotas must be at least 1");
            }

            let db = open(&config).await?;
            let consumer = select_consumer(&db, id, name).await?;
            db.set_consumer_quotas(consumer.id, max_concurrent, max_per_day)
                .await?;
            println!("ok");
        }
        AdminCommands::RotateKey { id, name } => {
            let db = open(&config).await?;
            let consumer = select_consumer(&db, id, name).await?;

            let key_id = auth::generate_key_id();
            let token = format!("{key_id}.{}", auth::generate_secret());
            let hash = auth::hash_token(&token);
            db.set_consumer_credentials(consumer.id, &key_id, &hash.salt, &hash.digest)
                .await?;

            println!("consumer_id: {}", consumer.id);
            println!("consumer_name: {}", consumer.name);
            println!("consumer_key: {token}");
        }
        AdminCommands::DeleteConsumer { id, name, yes } => {
            if !yes {
                bail!("refusing to delete without --yes");
            }

            let db = open(&config).await?;
            let consumer = select_consumer(&db, id, name).await?;
            db.delete_consumer(consumer.id).await?;
            println!("ok");
        }
        AdminCommands::ResetDb { yes } => {
            if !yes {
                bail!("refusing to reset without --yes");
            }

            let Some(path) = database_file(&config.database.url) else {
                bail!("refusing to reset an in-memory database");
            };
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("failed to delete `{}`", path.display()))?;
                println!("deleted: {}", path.display());
            } else {
                println!("missing: {}", path.display());
            }

            open(&config).await?;
            println!("initialized fresh database");
        }
        AdminCommands::DbInfo => {
            let url = &config.database.url;
            println!("database_url: {url}");
            match database_file(url) {
                Some(path) => {
                    println!("sqlite_path: {}", path.display());
                    println!("exists: {}", path.exists());
                }
                None => println!("sqlite_path: (in-memory)"),
            }
        }
    }

    Ok(())
}

/// Open the configured database, running migrations.
async fn open(config: &Config) -> Result<SqliteDatabase> {
    SqliteDatabase::new(&config.database.url)
        .await
        .context("failed to open database")
}

/// Resolve a consumer from `--id` or `--name`.
async fn select_consumer(
    db: &SqliteDatabase,
    id: Option<Uuid>,
    name: Option<String>,
) -> Result<Consumer> {
    let consumer = match (id, name) {
        (Some(id), _) => db.get_consumer(id).await?,
        (None, Some(name)) => db.get_consumer_by_name(&name).await?,
        (None, None) => bail!("pass `--id` or `--name` to select a consumer"),
    };

    consumer.context("consumer not found")
}
