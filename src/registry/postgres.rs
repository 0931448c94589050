//! PostgreSQL registry backend.
//!
//! Rows hold plain strings (timestamps as RFC 3339) so the schema stays
//! interchangeable with the wide-column backend. Every call checks a
//! connection out of the pool and returns it when the statement finishes.

use deadpool_postgres::{Config, Pool, PoolConfig, Runtime};
use secrecy::ExposeSecret;
use tokio_postgres::NoTls;
use tokio_postgres::error::SqlState;

use crate::config::PostgresConfig;
use crate::error::RegistryError;

use super::{JobRecord, Registry, parse_timestamp};

pub struct PostgresRegistry {
    pool: Pool,
    table: String,
}

impl PostgresRegistry {
    /// Build the pool and probe one connection so a bad configuration fails
    /// at startup instead of on the first request.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, RegistryError> {
        let (host, port) = match config.host.split_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| {
                    RegistryError::Pool(format!("invalid registry port in {:?}", config.host))
                })?;
                (host.to_string(), port)
            }
            None => (config.host.clone(), 5432),
        };

        let mut cfg = Config::new();
        cfg.host = Some(host);
        cfg.port = Some(port);
        cfg.dbname = Some(config.name.clone());
        cfg.user = Some(config.user.clone());
        cfg.password = Some(config.password.expose_secret().to_string());
        cfg.pool = Some(PoolConfig {
            max_size: config.pool_size,
            ..Default::default()
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| RegistryError::Pool(e.to_string()))?;

        let _ = pool.get().await?;

        Ok(Self {
            pool,
            table: config.table.clone(),
        })
    }
}

fn record_from_row(row: &tokio_postgres::Row) -> Result<JobRecord, RegistryError> {
    let start_time: String = row.get("start_time");
    let end_time: String = row.get("end_time");
    Ok(JobRecord {
        id: row.get("job_id"),
        user: row.get("user_id"),
        start_time: parse_timestamp(&start_time)?,
        end_time: parse_timestamp(&end_time)?,
        host: row.get("hostname"),
    })
}

#[async_trait::async_trait]
impl Registry for PostgresRegistry {
    async fn insert(&self, job: &JobRecord) -> Result<(), RegistryError> {
        let client = self.pool.get().await?;
        let query = format!(
            "INSERT INTO {}(job_id, user_id, start_time, end_time, hostname) \
             VALUES($1, $2, $3, $4, $5)",
            self.table
        );
        client
            .execute(
                query.as_str(),
                &[
                    &job.id,
                    &job.user,
                    &job.start_time.to_rfc3339(),
                    &job.end_time.to_rfc3339(),
                    &job.host,
                ],
            )
            .await
            .map_err(|e| {
                if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
                    RegistryError::Duplicate { id: job.id.clone() }
                } else {
                    RegistryError::Backend(e.to_string())
                }
            })?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<JobRecord, RegistryError> {
        let client = self.pool.get().await?;
        let query = format!(
            "SELECT job_id, user_id, start_time, end_time, hostname FROM {} WHERE job_id = $1",
            self.table
        );
        let row = client
            .query_opt(query.as_str(), &[&id])
            .await?
            .ok_or_else(|| RegistryError::NotFound { id: id.to_string() })?;
        record_from_row(&row)
    }

    async fn list(&self) -> Result<Vec<JobRecord>, RegistryError> {
        let client = self.pool.get().await?;
        let query = format!(
            "SELECT job_id, user_id, start_time, end_time, hostname FROM {}",
            self.table
        );
        let rows = client.query(query.as_str(), &[]).await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn update_host(&self, id: &str, host: &str) -> Result<(), RegistryError> {
        let client = self.pool.get().await?;
        let query = format!("UPDATE {} SET hostname = $1 WHERE job_id = $2", self.table);
        client.execute(query.as_str(), &[&host, &id]).await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), RegistryError> {
        let client = self.pool.get().await?;
        let query = format!("DELETE FROM {} WHERE job_id = $1", self.table);
        client.execute(query.as_str(), &[&id]).await?;
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<(), RegistryError> {
        let client = self.pool.get().await?;
        let query = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n\
             job_id VARCHAR(255) PRIMARY KEY,\n\
             user_id VARCHAR(255) NOT NULL,\n\
             start_time VARCHAR(255) NOT NULL,\n\
             end_time VARCHAR(255) NOT NULL,\n\
             hostname VARCHAR(255) NOT NULL\n\
             )",
            self.table
        );
        client.execute(query.as_str(), &[]).await?;
        Ok(())
    }

    async fn recreate_schema(&self) -> Result<(), RegistryError> {
        {
            let client = self.pool.get().await?;
            let query = format!("DROP TABLE IF EXISTS {}", self.table);
            client.execute(query.as_str(), &[]).await?;
        }
        self.ensure_schema().await
    }
}
