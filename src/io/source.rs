//! Row sources: where the CSV byte stream comes from.

use crate::config::DatabaseConfig;
use crate::error::SourceError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, Config as PgConfig, NoTls};

/// Byte stream of CSV text, header row first.
pub type SourceStream = BoxStream<'static, Result<Bytes, SourceError>>;

/// How long `release` waits for the connection task before aborting it.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// A database-side export session.
///
/// The session is opened by [`open_export`](RowSource::open_export) and must
/// be handed back with [`release`](RowSource::release) on every exit path.
#[async_trait]
pub trait RowSource: Send {
    /// Start exporting `table` as CSV with a header row.
    async fn open_export(&mut self, table: &str) -> Result<SourceStream, SourceError>;

    /// Release the session. Calling this more than once is a no-op.
    async fn release(&mut self);
}

/// Quote a possibly schema-qualified table name for use in SQL.
pub fn quote_table(table: &str) -> Result<String, SourceError> {
    if table.is_empty() {
        return Err(SourceError::InvalidTable(table.to_string()));
    }
    let mut parts = Vec::new();
    for part in table.split('.') {
        if part.is_empty() {
            return Err(SourceError::InvalidTable(table.to_string()));
        }
        parts.push(format!("\"{}\"", part.replace('"', "\"\"")));
    }
    Ok(parts.join("."))
}

/// The COPY statement streaming `table` as CSV with a header row.
pub fn copy_statement(table: &str) -> Result<String, SourceError> {
    Ok(format!("COPY {} TO STDOUT WITH CSV HEADER", quote_table(table)?))
}

/// Exports a PostgreSQL table through `COPY ... TO STDOUT`.
pub struct PostgresSource {
    client: Option<Client>,
    connection: Option<JoinHandle<()>>,
}

impl PostgresSource {
    /// Open a dedicated connection.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, SourceError> {
        let mut pg = PgConfig::new();
        pg.host(&config.host);
        pg.port(config.port);
        pg.user(&config.user);
        pg.dbname(&config.dbname);
        pg.connect_timeout(Duration::from_secs(config.connect_timeout_secs));
        if let Some(password) = config.resolved_password() {
            pg.password(password);
        }

        let (client, connection) = pg.connect(NoTls).await.map_err(|e| SourceError::Connect {
            host: config.host.clone(),
            port: config.port,
            reason: e.to_string(),
        })?;

        let connection = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!("PostgreSQL connection error: {}", e);
            }
        });

        tracing::info!(
            "Connected to {}:{}/{} as {}",
            config.host,
            config.port,
            config.dbname,
            config.user
        );

        Ok(Self {
            client: Some(client),
            connection: Some(connection),
        })
    }
}

#[async_trait]
impl RowSource for PostgresSource {
    async fn open_export(&mut self, table: &str) -> Result<SourceStream, SourceError> {
        let client = self.client.as_ref().ok_or(SourceError::Released)?;
        let statement = copy_statement(table)?;
        tracing::info!("Starting {}", statement);

        let stream = client.copy_out(statement.as_str()).await?;
        Ok(stream.map_err(SourceError::from).boxed())
    }

    async fn release(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        drop(client);

        if let Some(mut connection) = self.connection.take() {
            match tokio::time::timeout(RELEASE_TIMEOUT, &mut connection).await {
                Ok(_) => tracing::debug!("PostgreSQL connection closed"),
                Err(_) => {
                    tracing::warn!("PostgreSQL connection did not close in time, aborting");
                    connection.abort();
                }
            }
        }
    }
}
