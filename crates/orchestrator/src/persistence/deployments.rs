use chrono::{DateTime, Utc};
use common::api::DeploymentStatus;
use sqlx::FromRow;
use uuid::Uuid;

use super::Db;

/// Persisted shape of one deployment. The id, owner and source description
/// are immutable after insert; everything else is written by the pipeline as
/// the deployment moves through its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentRecord {
    pub id: Uuid,
    pub owner: String,
    pub status: DeploymentStatus,
    pub source_description: String,
    pub port: Option<u16>,
    pub container_ref: Option<String>,
    pub error: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewDeployment {
    pub id: Uuid,
    pub owner: String,
    pub status: DeploymentStatus,
    pub source_description: String,
}

impl NewDeployment {
    pub fn into_record(self, queued_at: DateTime<Utc>) -> DeploymentRecord {
        DeploymentRecord {
            id: self.id,
            owner: self.owner,
            status: self.status,
            source_description: self.source_description,
            port: None,
            container_ref: None,
            error: None,
            queued_at,
            started_at: None,
            completed_at: None,
        }
    }
}

// SQLite has no enum type; status travels as TEXT and is validated on read.
#[derive(Debug, FromRow)]
struct DeploymentRow {
    id: Uuid,
    owner: String,
    status: String,
    source_description: String,
    port: Option<i64>,
    container_ref: Option<String>,
    error: Option<String>,
    queued_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<DeploymentRow> for DeploymentRecord {
    type Error = sqlx::Error;

    fn try_from(row: DeploymentRow) -> Result<Self, sqlx::Error> {
        let status = DeploymentStatus::parse(&row.status).ok_or_else(|| {
            sqlx::Error::ColumnDecode {
                index: "status".into(),
                source: format!("unknown deployment status {:?}", row.status).into(),
            }
        })?;
        let port = match row.port {
            Some(value) => Some(u16::try_from(value).map_err(|_| sqlx::Error::ColumnDecode {
                index: "port".into(),
                source: format!("port {value} out of range").into(),
            })?),
            None => None,
        };
        Ok(DeploymentRecord {
            id: row.id,
            owner: row.owner,
            status,
            source_description: row.source_description,
            port,
            container_ref: row.container_ref,
            error: row.error,
            queued_at: row.queued_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

const SELECT_COLUMNS: &str = "id, owner, status, source_description, port, container_ref, \
                              error, queued_at, started_at, completed_at";

/// Insert or fully replace a deployment record.
pub async fn upsert(db: &Db, record: &DeploymentRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO deployments (
            id, owner, status, source_description, port, container_ref,
            error, queued_at, started_at, completed_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(id) DO UPDATE SET
            status = excluded.status,
            port = excluded.port,
            container_ref = excluded.container_ref,
            error = excluded.error,
            started_at = excluded.started_at,
            completed_at = excluded.completed_at
        "#,
    )
    .bind(record.id)
    .bind(&record.owner)
    .bind(record.status.as_str())
    .bind(&record.source_description)
    .bind(record.port.map(i64::from))
    .bind(&record.container_ref)
    .bind(&record.error)
    .bind(record.queued_at)
    .bind(record.started_at)
    .bind(record.completed_at)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn get(db: &Db, id: Uuid) -> Result<Option<DeploymentRecord>, sqlx::Error> {
    let row = sqlx::query_as::<_, DeploymentRow>(&format!(
        "SELECT {SELECT_COLUMNS} FROM deployments WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(db)
    .await?;

    row.map(DeploymentRecord::try_from).transpose()
}

/// All deployments, newest first, optionally restricted to one owner.
pub async fn list(db: &Db, owner: Option<&str>) -> Result<Vec<DeploymentRecord>, sqlx::Error> {
    let rows = match owner {
        Some(owner) => {
            sqlx::query_as::<_, DeploymentRow>(&format!(
                "SELECT {SELECT_COLUMNS} FROM deployments \
                 WHERE owner = ?1 ORDER BY queued_at DESC, id DESC"
            ))
            .bind(owner)
            .fetch_all(db)
            .await?
        }
        None => {
            sqlx::query_as::<_, DeploymentRow>(&format!(
                "SELECT {SELECT_COLUMNS} FROM deployments ORDER BY queued_at DESC, id DESC"
            ))
            .fetch_all(db)
            .await?
        }
    };

    rows.into_iter().map(DeploymentRecord::try_from).collect()
}

pub async fn list_by_status(
    db: &Db,
    status: DeploymentStatus,
) -> Result<Vec<DeploymentRecord>, sqlx::Error> {
    let rows = sqlx::query_as::<_, DeploymentRow>(&format!(
        "SELECT {SELECT_COLUMNS} FROM deployments WHERE status = ?1 ORDER BY queued_at ASC"
    ))
    .bind(status.as_str())
    .fetch_all(db)
    .await?;

    rows.into_iter().map(DeploymentRecord::try_from).collect()
}

/// Remove a record outright. Returns whether a row existed.
pub async fn delete(db: &Db, id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM deployments WHERE id = ?1")
        .bind(id)
        .execute(db)
        .await?;
    Ok(result.rows_affected() > 0)
}
