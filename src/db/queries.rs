use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::db::repository::{
    CreatedJob, JobFacets, JobFilter, JobRepository, NewAnalysis, RepoError, SortOrder,
};
use crate::models::job::{AnalysisJob, FailureDetail, ImageRef, JobStatus};
use crate::models::prediction::Prediction;

const SELECT_JOBS: &str = r#"
    SELECT j.id, j.image_id, i.image_key, i.user_id, i.uploaded_at,
           j.model_name, j.use_category, j.status, j.label, j.top_predictions,
           j.reliability, j.started_at, j.ended_at, j.error_kind, j.error_detail,
           j.run_id, j.version
    FROM analysis_jobs j
    JOIN images i ON i.id = j.image_id
"#;

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    image_id: Uuid,
    image_key: String,
    user_id: i64,
    uploaded_at: DateTime<Utc>,
    model_name: String,
    use_category: bool,
    status: String,
    label: Option<String>,
    top_predictions: Option<Json<Vec<Prediction>>>,
    reliability: Option<f64>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    error_kind: Option<String>,
    error_detail: Option<String>,
    run_id: Uuid,
    version: i64,
}

impl TryFrom<JobRow> for AnalysisJob {
    type Error = RepoError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::from_str(&row.status).map_err(|_| RepoError::Corrupt {
            id: row.id,
            reason: format!("unknown status {:?}", row.status),
        })?;

        Ok(AnalysisJob {
            id: row.id,
            image: ImageRef {
                image_id: row.image_id,
                key: row.image_key,
            },
            user_id: row.user_id,
            uploaded_at: row.uploaded_at,
            model_name: row.model_name,
            use_category: row.use_category,
            status,
            label: row.label,
            top_predictions: row.top_predictions.map(|Json(list)| list),
            reliability: row.reliability,
            started_at: row.started_at,
            ended_at: row.ended_at,
            error_kind: row.error_kind,
            error_detail: row.error_detail,
            run_id: row.run_id,
            version: row.version,
        })
    }
}

/// Postgres-backed job repository.
#[derive(Clone)]
pub struct PgJobRepository {
    pool: PgPool,
}

impl PgJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn create(&self, new: NewAnalysis) -> Result<CreatedJob, RepoError> {
        let image_id = Uuid::new_v4();

        let mut tx = self.pool.begin().await?;

        // a concurrent insert of the same key blocks here until it commits
        let uploaded_at: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            INSERT INTO images (id, user_id, image_key)
            VALUES ($1, $2, $3)
            ON CONFLICT (image_key) DO NOTHING
            RETURNING uploaded_at
            "#,
        )
        .bind(image_id)
        .bind(new.user_id)
        .bind(&new.image_key)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(uploaded_at) = uploaded_at else {
            tx.rollback().await?;
            let row = sqlx::query_as::<_, JobRow>(&format!("{} WHERE i.image_key = $1", SELECT_JOBS))
                .bind(&new.image_key)
                .fetch_optional(&self.pool)
                .await?
                .ok_or(RepoError::Database(sqlx::Error::RowNotFound))?;
            return Ok(CreatedJob {
                job: AnalysisJob::try_from(row)?,
                inserted: false,
            });
        };

        let job = AnalysisJob::new(
            Uuid::new_v4(),
            ImageRef {
                image_id,
                key: new.image_key,
            },
            new.user_id,
            uploaded_at,
            new.model_name,
            new.use_category,
        );

        sqlx::query(
            r#"
            INSERT INTO analysis_jobs (id, image_id, model_name, use_category, status, run_id)
            VALUES ($1, $2, $3, $4, 'pending', $5)
            "#,
        )
        .bind(job.id)
        .bind(image_id)
        .bind(&job.model_name)
        .bind(job.use_category)
        .bind(job.run_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(CreatedJob {
            job,
            inserted: true,
        })
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<AnalysisJob>, RepoError> {
        let row = sqlx::query_as::<_, JobRow>(&format!("{} WHERE j.id = $1", SELECT_JOBS))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(AnalysisJob::try_from).transpose()
    }

    async fn save(&self, job: &mut AnalysisJob) -> Result<(), RepoError> {
        let result = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET model_name = $2, use_category = $3, status = $4, label = $5,
                top_predictions = $6, reliability = $7, started_at = $8,
                ended_at = $9, error_kind = $10, error_detail = $11,
                run_id = $12, version = version + 1
            WHERE id = $1 AND version = $13
            "#,
        )
        .bind(job.id)
        .bind(&job.model_name)
        .bind(job.use_category)
        .bind(job.status.as_ref())
        .bind(&job.label)
        .bind(job.top_predictions.as_ref().map(Json))
        .bind(job.reliability)
        .bind(job.started_at)
        .bind(job.ended_at)
        .bind(&job.error_kind)
        .bind(&job.error_detail)
        .bind(job.run_id)
        .bind(job.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::Conflict(job.id));
        }
        job.version += 1;
        Ok(())
    }

    async fn mark_ended(
        &self,
        job_id: Uuid,
        expected_version: i64,
        failure: &FailureDetail,
        at: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        let result = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET status = 'failed', label = NULL, reliability = NULL, top_predictions = NULL,
                error_kind = $3, error_detail = $4, ended_at = $5,
                version = version + 1
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(job_id)
        .bind(expected_version)
        .bind(&failure.kind)
        .bind(&failure.detail)
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::Conflict(job_id));
        }
        Ok(())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<AnalysisJob>, RepoError> {
        let mut query: QueryBuilder<Postgres> = QueryBuilder::new(SELECT_JOBS);
        query.push(" WHERE TRUE");

        if let Some(user_id) = filter.user_id {
            query.push(" AND i.user_id = ").push_bind(user_id);
        }
        if let Some(status) = filter.status {
            query.push(" AND j.status = ").push_bind(status.as_ref().to_string());
        }
        if let Some(label) = &filter.label {
            query.push(" AND j.label = ").push_bind(label.clone());
        }
        if let Some(model_name) = &filter.model_name {
            query.push(" AND j.model_name = ").push_bind(model_name.clone());
        }
        if let Some(error_kind) = &filter.error_kind {
            query.push(" AND j.error_kind = ").push_bind(error_kind.clone());
        }

        query.push(match filter.sort {
            SortOrder::Asc => " ORDER BY i.uploaded_at ASC, j.id ASC",
            SortOrder::Desc => " ORDER BY i.uploaded_at DESC, j.id DESC",
        });

        let rows = query
            .build_query_as::<JobRow>()
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(AnalysisJob::try_from).collect()
    }

    async fn pending_order(&self) -> Result<Vec<Uuid>, RepoError> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT j.id
            FROM analysis_jobs j
            JOIN images i ON i.id = j.image_id
            WHERE j.status = 'pending'
            ORDER BY i.uploaded_at ASC, j.id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn facets(&self, user_id: Option<i64>) -> Result<JobFacets, RepoError> {
        let distinct = |column: &'static str| {
            format!(
                r#"
                SELECT DISTINCT j.{column}
                FROM analysis_jobs j
                JOIN images i ON i.id = j.image_id
                WHERE j.{column} IS NOT NULL AND j.{column} <> ''
                  AND ($1::BIGINT IS NULL OR i.user_id = $1)
                ORDER BY j.{column}
                "#
            )
        };

        let mut facets = JobFacets::default();
        for (column, target) in [
            ("label", &mut facets.labels),
            ("model_name", &mut facets.models),
            ("error_kind", &mut facets.error_kinds),
        ] {
            *target = sqlx::query_scalar::<_, String>(&distinct(column))
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        }
        Ok(facets)
    }

    async fn delete_image(&self, image_id: Uuid) -> Result<Option<ImageRef>, RepoError> {
        let key = sqlx::query_scalar::<_, String>(
            "DELETE FROM images WHERE id = $1 RETURNING image_key",
        )
        .bind(image_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(key.map(|key| ImageRef { image_id, key }))
    }

    async fn health_check(&self) -> Result<(), RepoError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
