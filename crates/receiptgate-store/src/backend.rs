// SPDX-License-Identifier: MIT OR Apache-2.0
//! The two supported persistence dialects.
//!
//! A `sqlx::Any` pool would let one code path serve both, but `Any` erases
//! placeholder syntax (`?` vs `$1`) and JSON column handling differences
//! between SQLite and Postgres. With only two dialects and a narrow,
//! hand-countable query surface, an explicit enum with one match arm per
//! backend is less code than working around `Any`'s limitations.

use receiptgate_error::{ErrorKind, ReceiptGateError};
use sqlx::{PgPool, SqlitePool};

/// A connected persistence backend.
#[derive(Debug, Clone)]
pub enum Backend {
    /// An embedded SQLite database, identified by a `sqlite:` URL.
    Sqlite(SqlitePool),
    /// A Postgres database, identified by a `postgres://` or `postgresql://` URL.
    Postgres(PgPool),
}

impl Backend {
    /// Connect to `database_url`, selecting the dialect from its scheme.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Backend`] if the URL scheme is unrecognised or
    /// the connection attempt fails.
    pub async fn connect(database_url: &str) -> Result<Self, ReceiptGateError> {
        if database_url.starts_with("sqlite:") {
            let pool = SqlitePool::connect(database_url).await.map_err(|e| {
                ReceiptGateError::new(ErrorKind::Backend, "failed to connect to sqlite database")
                    .with_source(e)
            })?;
            Ok(Self::Sqlite(pool))
        } else if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://")
        {
            let pool = PgPool::connect(database_url).await.map_err(|e| {
                ReceiptGateError::new(ErrorKind::Backend, "failed to connect to postgres database")
                    .with_source(e)
            })?;
            Ok(Self::Postgres(pool))
        } else {
            Err(ReceiptGateError::new(
                ErrorKind::Backend,
                format!("unrecognised database URL scheme in {database_url:?}"),
            ))
        }
    }

    /// Run the embedded migrations for whichever dialect this backend is.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Backend`] if a migration fails to apply.
    pub async fn migrate(&self) -> Result<(), ReceiptGateError> {
        match self {
            Self::Sqlite(pool) => sqlx::migrate!("migrations/sqlite")
                .run(pool)
                .await
                .map_err(|e| {
                    ReceiptGateError::new(ErrorKind::Backend, "sqlite migration failed").with_source(e)
                }),
            Self::Postgres(pool) => sqlx::migrate!("migrations/postgres")
                .run(pool)
                .await
                .map_err(|e| {
                    ReceiptGateError::new(ErrorKind::Backend, "postgres migration failed")
                        .with_source(e)
                }),
        }
    }

    /// Stable label for logging (`"sqlite"` or `"postgres"`).
    #[must_use]
    pub fn dialect(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "sqlite",
            Self::Postgres(_) => "postgres",
        }
    }
}
