/**
 * Access-Token Ledger
 *
 * A small persistent table recording every WOPI access token the server has
 * accepted, so a captured token cannot be replayed to open the document
 * again. Tokens are first-seen: the first presentation records and admits,
 * any later presentation is refused (unless the URI carries `docpass=yes`,
 * checked by the caller).
 *
 * The ledger is process-wide; SQLite's single-writer discipline is enough
 * for the transactional safety it needs.
 */

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct TokenLedger {
    pool: SqlitePool,
}

impl TokenLedger {
    /// Open (creating if missing) the ledger database at `path`.
    pub async fn open(path: &Path) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::init(pool).await
    }

    /// In-memory ledger, used by tests.
    pub async fn open_in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::init(pool).await
    }

    async fn init(pool: SqlitePool) -> Result<Self, sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tokens (
                token TEXT PRIMARY KEY NOT NULL UNIQUE,
                expires INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Record a token, reporting whether this was its first use.
    ///
    /// A single conflict-ignoring insert decides atomically: when the token
    /// row already exists no row changes and the caller must refuse the
    /// session.
    pub async fn first_use(&self, token: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO tokens (token, expires)
            VALUES (?, strftime('%s', 'now'))
            ON CONFLICT(token) DO NOTHING
            "#,
        )
        .bind(token)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Drop tokens whose expiry stamp is older than `cutoff_epoch_secs`.
    pub async fn purge_older_than(&self, cutoff_epoch_secs: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM tokens WHERE expires < ?")
            .bind(cutoff_epoch_secs)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_use_then_replay() {
        let ledger = TokenLedger::open_in_memory().await.unwrap();
        assert!(ledger.first_use("tok-1").await.unwrap());
        assert!(!ledger.first_use("tok-1").await.unwrap());
        assert!(ledger.first_use("tok-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_purge() {
        let ledger = TokenLedger::open_in_memory().await.unwrap();
        ledger.first_use("tok-old").await.unwrap();
        // Everything inserted above is stamped "now", so a far-future cutoff
        // removes it all.
        let removed = ledger.purge_older_than(i64::MAX).await.unwrap();
        assert_eq!(removed, 1);
        assert!(ledger.first_use("tok-old").await.unwrap());
    }
}
