//! PostgreSQL deployment store implementation.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::{error, info};

use crate::config::DatabaseConfig;
use crate::error::{FuotaError, FuotaResult};
use crate::types::{
    now, DevEui, DeploymentId, DeploymentState, DeviceOutcome, DeviceState, EnrolledDevice,
    FuotaDeployment, MulticastGroupId, Page, Participant,
};

use super::{DeploymentStore, StoreTransaction};

const DEPLOYMENT_COLUMNS: &str = r#"
    id, created_at, updated_at, name, multicast_group_id, fragmentation_matrix,
    descriptor, payload, state, next_step_after, frag_size, redundancy,
    block_ack_delay, multicast_timeout, unicast_timeout_ns, retry_count
"#;

/// PostgreSQL-backed deployment store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to PostgreSQL and create a new store.
    ///
    /// The required tables are created if they don't exist.
    pub async fn new(config: &DatabaseConfig) -> FuotaResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await?;

        Self::from_pool(pool).await
    }

    /// Create a store from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> FuotaResult<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Ensure the required tables exist.
    async fn ensure_schema(&self) -> FuotaResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fuota_deployment (
                id UUID PRIMARY KEY,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                name TEXT NOT NULL,
                multicast_group_id UUID,
                fragmentation_matrix BYTEA NOT NULL,
                descriptor BYTEA NOT NULL,
                payload BYTEA NOT NULL,
                state TEXT NOT NULL,
                next_step_after TIMESTAMPTZ NOT NULL,
                frag_size BIGINT NOT NULL,
                redundancy BIGINT NOT NULL,
                block_ack_delay BIGINT NOT NULL,
                multicast_timeout BIGINT NOT NULL,
                unicast_timeout_ns BIGINT NOT NULL,
                retry_count BIGINT NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Tables created before timeouts were kept at nanosecond precision.
        sqlx::query(
            r#"
            DO $$
            BEGIN
                IF EXISTS (
                    SELECT 1 FROM information_schema.columns
                    WHERE table_schema = current_schema()
                      AND table_name = 'fuota_deployment'
                      AND column_name = 'unicast_timeout_ms'
                ) THEN
                    ALTER TABLE fuota_deployment ADD COLUMN IF NOT EXISTS unicast_timeout_ns BIGINT;
                    UPDATE fuota_deployment SET unicast_timeout_ns = unicast_timeout_ms * 1000000;
                    ALTER TABLE fuota_deployment ALTER COLUMN unicast_timeout_ns SET NOT NULL;
                    ALTER TABLE fuota_deployment DROP COLUMN unicast_timeout_ms;
                END IF;
            END $$
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fuota_deployment_device (
                fuota_deployment_id UUID NOT NULL
                    REFERENCES fuota_deployment(id) ON DELETE CASCADE,
                dev_eui BYTEA NOT NULL,
                device_name TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                state TEXT NOT NULL,
                error_message TEXT NOT NULL DEFAULT '',
                PRIMARY KEY (fuota_deployment_id, dev_eui)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_fuota_deployment_due
            ON fuota_deployment (next_step_after)
            WHERE state <> 'DONE' AND multicast_group_id IS NOT NULL
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Parse a row into a deployment, validating every encoded field.
    fn row_to_deployment(row: &PgRow) -> FuotaResult<FuotaDeployment> {
        let id: uuid::Uuid = row.try_get("id")?;
        let multicast_group_id: Option<uuid::Uuid> = row.try_get("multicast_group_id")?;
        let matrix: Vec<u8> = row.try_get("fragmentation_matrix")?;
        let descriptor: Vec<u8> = row.try_get("descriptor")?;
        let state: String = row.try_get("state")?;
        let unicast_timeout_ns: i64 = row.try_get("unicast_timeout_ns")?;

        let fragmentation_matrix = match matrix.as_slice() {
            [b] => *b,
            other => {
                return Err(FuotaError::integrity(format!(
                    "fragmentation_matrix of deployment {id} is {} bytes, expected 1",
                    other.len()
                )))
            }
        };
        let descriptor: [u8; 4] = descriptor.as_slice().try_into().map_err(|_| {
            FuotaError::integrity(format!(
                "descriptor of deployment {id} is {} bytes, expected 4",
                descriptor.len()
            ))
        })?;
        let state: DeploymentState = state.parse().map_err(|e| {
            FuotaError::integrity(format!("deployment {id} has invalid state: {e}"))
        })?;
        let unicast_timeout_ns = u64::try_from(unicast_timeout_ns).map_err(|_| {
            FuotaError::integrity(format!(
                "deployment {id} has negative unicast timeout {unicast_timeout_ns}"
            ))
        })?;

        Ok(FuotaDeployment {
            id: DeploymentId::new(id),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            name: row.try_get("name")?,
            multicast_group_id: multicast_group_id.map(MulticastGroupId::new),
            fragmentation_matrix,
            descriptor,
            payload: row.try_get("payload")?,
            state,
            next_step_after: row.try_get("next_step_after")?,
            frag_size: get_u32(row, "frag_size")?,
            redundancy: get_u32(row, "redundancy")?,
            block_ack_delay: get_u32(row, "block_ack_delay")?,
            multicast_timeout: get_u32(row, "multicast_timeout")?,
            unicast_timeout: Duration::from_nanos(unicast_timeout_ns),
            retry_count: get_u32(row, "retry_count")?,
        })
    }

    fn row_to_participant(row: &PgRow) -> FuotaResult<Participant> {
        let deployment_id: uuid::Uuid = row.try_get("fuota_deployment_id")?;
        let dev_eui: Vec<u8> = row.try_get("dev_eui")?;
        let state: String = row.try_get("state")?;

        Ok(Participant {
            deployment_id: DeploymentId::new(deployment_id),
            dev_eui: DevEui::from_slice(&dev_eui)?,
            device_name: row.try_get("device_name")?,
            state: state.parse().map_err(|e| {
                FuotaError::integrity(format!("device of deployment {deployment_id}: {e}"))
            })?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

fn get_u32(row: &PgRow, column: &str) -> FuotaResult<u32> {
    let value: i64 = row.try_get(column)?;
    u32::try_from(value)
        .map_err(|_| FuotaError::integrity(format!("{column} out of range: {value}")))
}

/// How far an unreadable row is pushed back so it stops heading every claim.
fn quarantine_delay() -> TimeDelta {
    TimeDelta::hours(1)
}

fn count_to_u64(count: i64) -> u64 {
    u64::try_from(count).unwrap_or(0)
}

fn unicast_timeout_ns(deployment: &FuotaDeployment) -> FuotaResult<i64> {
    i64::try_from(deployment.unicast_timeout.as_nanos()).map_err(|_| {
        FuotaError::internal(format!(
            "unicast timeout {:?} of deployment {} does not fit in storage",
            deployment.unicast_timeout, deployment.id
        ))
    })
}

#[async_trait]
impl DeploymentStore for PostgresStore {
    async fn create(
        &self,
        deployment: &FuotaDeployment,
        devices: &[EnrolledDevice],
    ) -> FuotaResult<()> {
        let unicast_timeout = unicast_timeout_ns(deployment)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO fuota_deployment (
                id, created_at, updated_at, name, multicast_group_id,
                fragmentation_matrix, descriptor, payload, state, next_step_after,
                frag_size, redundancy, block_ack_delay, multicast_timeout,
                unicast_timeout_ns, retry_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(deployment.id.as_uuid())
        .bind(deployment.created_at)
        .bind(deployment.updated_at)
        .bind(&deployment.name)
        .bind(deployment.multicast_group_id.map(|g| *g.as_uuid()))
        .bind(vec![deployment.fragmentation_matrix])
        .bind(deployment.descriptor.to_vec())
        .bind(&deployment.payload)
        .bind(deployment.state.as_str())
        .bind(deployment.next_step_after)
        .bind(i64::from(deployment.frag_size))
        .bind(i64::from(deployment.redundancy))
        .bind(i64::from(deployment.block_ack_delay))
        .bind(i64::from(deployment.multicast_timeout))
        .bind(unicast_timeout)
        .bind(i64::from(deployment.retry_count))
        .execute(&mut *tx)
        .await?;

        for device in devices {
            sqlx::query(
                r#"
                INSERT INTO fuota_deployment_device (
                    fuota_deployment_id, dev_eui, device_name,
                    created_at, updated_at, state, error_message
                )
                VALUES ($1, $2, $3, $4, $4, $5, '')
                "#,
            )
            .bind(deployment.id.as_uuid())
            .bind(device.dev_eui.as_bytes().to_vec())
            .bind(&device.name)
            .bind(deployment.created_at)
            .bind(DeviceState::Pending.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        info!(
            deployment_id = %deployment.id,
            devices = devices.len(),
            "fuota deployment created"
        );
        Ok(())
    }

    async fn get(&self, id: &DeploymentId) -> FuotaResult<Option<FuotaDeployment>> {
        let row = sqlx::query(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM fuota_deployment WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_deployment).transpose()
    }

    async fn list_pending(&self, limit: u32) -> FuotaResult<Vec<FuotaDeployment>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {DEPLOYMENT_COLUMNS}
            FROM fuota_deployment
            WHERE state <> 'DONE'
            ORDER BY next_step_after, id
            LIMIT $1
            "#
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_deployment).collect()
    }

    async fn device_count(&self, id: &DeploymentId) -> FuotaResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM fuota_deployment_device WHERE fuota_deployment_id = $1",
        )
        .bind(id.as_uuid())
        .fetch_one(&self.pool)
        .await?;

        Ok(count_to_u64(count))
    }

    async fn pending_count(&self, id: &DeploymentId) -> FuotaResult<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM fuota_deployment_device
            WHERE fuota_deployment_id = $1 AND state = 'PENDING'
            "#,
        )
        .bind(id.as_uuid())
        .fetch_one(&self.pool)
        .await?;

        Ok(count_to_u64(count))
    }

    async fn list_devices(&self, id: &DeploymentId, page: Page) -> FuotaResult<Vec<Participant>> {
        let rows = sqlx::query(
            r#"
            SELECT fuota_deployment_id, dev_eui, device_name, state,
                   error_message, created_at, updated_at
            FROM fuota_deployment_device
            WHERE fuota_deployment_id = $1
            ORDER BY device_name, dev_eui
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(id.as_uuid())
        .bind(i64::from(page.limit))
        .bind(i64::from(page.offset))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_participant).collect()
    }

    async fn begin(&self) -> FuotaResult<Box<dyn StoreTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTransaction { tx }))
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}

/// An open PostgreSQL transaction.
///
/// Dropping it returns the connection to the pool and rolls back.
struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    async fn get_for_update(&mut self, id: &DeploymentId) -> FuotaResult<Option<FuotaDeployment>> {
        let row = sqlx::query(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM fuota_deployment WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(PostgresStore::row_to_deployment).transpose()
    }

    async fn claim_due(
        &mut self,
        batch_size: u32,
        now: DateTime<Utc>,
    ) -> FuotaResult<Vec<FuotaDeployment>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {DEPLOYMENT_COLUMNS}
            FROM fuota_deployment
            WHERE state <> 'DONE'
              AND multicast_group_id IS NOT NULL
              AND next_step_after <= $1
            ORDER BY next_step_after
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(now)
        .bind(i64::from(batch_size))
        .fetch_all(&mut *self.tx)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        let mut corrupt = Vec::new();
        for row in &rows {
            match PostgresStore::row_to_deployment(row) {
                Ok(deployment) => claimed.push(deployment),
                Err(e) => {
                    let id: uuid::Uuid = row.try_get("id")?;
                    error!(
                        deployment_id = %id,
                        error = %e,
                        "deployment row unreadable, quarantined"
                    );
                    corrupt.push(id);
                }
            }
        }

        if !corrupt.is_empty() {
            sqlx::query("UPDATE fuota_deployment SET next_step_after = $2 WHERE id = ANY($1)")
                .bind(corrupt.as_slice())
                .bind(now + quarantine_delay())
                .execute(&mut *self.tx)
                .await?;
        }

        Ok(claimed)
    }

    async fn update(&mut self, deployment: &mut FuotaDeployment) -> FuotaResult<()> {
        let unicast_timeout = unicast_timeout_ns(deployment)?;
        deployment.updated_at = now();

        let result = sqlx::query(
            r#"
            UPDATE fuota_deployment
            SET updated_at = $2,
                name = $3,
                multicast_group_id = $4,
                fragmentation_matrix = $5,
                descriptor = $6,
                payload = $7,
                state = $8,
                next_step_after = $9,
                frag_size = $10,
                redundancy = $11,
                block_ack_delay = $12,
                multicast_timeout = $13,
                unicast_timeout_ns = $14,
                retry_count = $15
            WHERE id = $1
            "#,
        )
        .bind(deployment.id.as_uuid())
        .bind(deployment.updated_at)
        .bind(&deployment.name)
        .bind(deployment.multicast_group_id.map(|g| *g.as_uuid()))
        .bind(vec![deployment.fragmentation_matrix])
        .bind(deployment.descriptor.to_vec())
        .bind(&deployment.payload)
        .bind(deployment.state.as_str())
        .bind(deployment.next_step_after)
        .bind(i64::from(deployment.frag_size))
        .bind(i64::from(deployment.redundancy))
        .bind(i64::from(deployment.block_ack_delay))
        .bind(i64::from(deployment.multicast_timeout))
        .bind(unicast_timeout)
        .bind(i64::from(deployment.retry_count))
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(FuotaError::DeploymentNotFound(deployment.id.to_string()));
        }

        info!(
            deployment_id = %deployment.id,
            state = %deployment.state,
            next_step_after = %deployment.next_step_after,
            "fuota deployment updated"
        );
        Ok(())
    }

    async fn record_device_outcome(
        &mut self,
        id: &DeploymentId,
        dev_eui: &DevEui,
        outcome: DeviceOutcome,
        message: &str,
    ) -> FuotaResult<()> {
        let current: Option<String> = sqlx::query_scalar(
            r#"
            SELECT state FROM fuota_deployment_device
            WHERE fuota_deployment_id = $1 AND dev_eui = $2
            FOR UPDATE
            "#,
        )
        .bind(id.as_uuid())
        .bind(dev_eui.as_bytes().to_vec())
        .fetch_optional(&mut *self.tx)
        .await?;

        let current: DeviceState = current
            .ok_or_else(|| FuotaError::DeviceNotFound {
                deployment_id: id.to_string(),
                dev_eui: dev_eui.to_string(),
            })?
            .parse()
            .map_err(|e| FuotaError::integrity(format!("device {dev_eui}: {e}")))?;

        if current.is_terminal() {
            return Err(FuotaError::AlreadyTerminal {
                deployment_id: id.to_string(),
                dev_eui: dev_eui.to_string(),
                state: current.as_str(),
            });
        }

        sqlx::query(
            r#"
            UPDATE fuota_deployment_device
            SET state = $3, error_message = $4, updated_at = $5
            WHERE fuota_deployment_id = $1 AND dev_eui = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(dev_eui.as_bytes().to_vec())
        .bind(outcome.state().as_str())
        .bind(message)
        .bind(now())
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn pending_devices(&mut self, id: &DeploymentId) -> FuotaResult<Vec<DevEui>> {
        let rows: Vec<Vec<u8>> = sqlx::query_scalar(
            r#"
            SELECT dev_eui FROM fuota_deployment_device
            WHERE fuota_deployment_id = $1 AND state = 'PENDING'
            ORDER BY dev_eui
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await?;

        rows.iter().map(|b| DevEui::from_slice(b)).collect()
    }

    async fn fail_pending_devices(&mut self, id: &DeploymentId, message: &str) -> FuotaResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE fuota_deployment_device
            SET state = 'ERROR', error_message = $2, updated_at = $3
            WHERE fuota_deployment_id = $1 AND state = 'PENDING'
            "#,
        )
        .bind(id.as_uuid())
        .bind(message)
        .bind(now())
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected())
    }

    async fn savepoint(&mut self) -> FuotaResult<()> {
        sqlx::query("SAVEPOINT fuota_step")
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self) -> FuotaResult<()> {
        sqlx::query("ROLLBACK TO SAVEPOINT fuota_step")
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn release_savepoint(&mut self) -> FuotaResult<()> {
        sqlx::query("RELEASE SAVEPOINT fuota_step")
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> FuotaResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> FuotaResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
