use anyhow::{Context, Result};
use sqlx::{migrate::Migrator, postgres::PgPool};
use tracing::info;

pub static MIGRATOR: Migrator = sqlx::migrate!("./src/db/migrations");

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    MIGRATOR.run(pool).await.context("failed to apply chat postgres migrations")?;
    info!(migrations = MIGRATOR.iter().count(), "chat postgres schema is up to date");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::MIGRATOR;

    #[test]
    fn embedded_migrations_create_the_message_log() {
        let first = MIGRATOR.iter().next().expect("at least one migration should be embedded");
        assert_eq!(first.version, 1);
        assert!(first.sql.contains("chat_messages"));
        assert!(first.sql.contains("UNIQUE (room_id, seq)"));
    }
}
