use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row};

use crate::models::detection::{Detection, DetectionResult};

/// Insert a detection result, overwriting any earlier write for the same job.
pub async fn upsert_result(pool: &PgPool, result: &DetectionResult) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO detection_results
            (job_id, original_img_path, predicted_img_path, labels, completed_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (job_id) DO UPDATE
        SET original_img_path = EXCLUDED.original_img_path,
            predicted_img_path = EXCLUDED.predicted_img_path,
            labels = EXCLUDED.labels,
            completed_at = EXCLUDED.completed_at,
            write_count = detection_results.write_count + 1,
            updated_at = NOW()
        "#,
    )
    .bind(&result.job_id)
    .bind(&result.original_image_path)
    .bind(&result.annotated_image_path)
    .bind(Json(&result.detections))
    .bind(result.completed_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a detection result by job id
pub async fn get_result(
    pool: &PgPool,
    job_id: &str,
) -> Result<Option<DetectionResult>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT job_id, original_img_path, predicted_img_path, labels, completed_at
        FROM detection_results
        WHERE job_id = $1
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.map(|r| -> Result<DetectionResult, sqlx::Error> {
        let labels: Json<Vec<Detection>> = r.try_get("labels")?;
        let completed_at: DateTime<Utc> = r.try_get("completed_at")?;
        Ok(DetectionResult {
            job_id: r.try_get("job_id")?,
            original_image_path: r.try_get("original_img_path")?,
            annotated_image_path: r.try_get("predicted_img_path")?,
            detections: labels.0,
            completed_at,
        })
    })
    .transpose()
}

/// Number of times a job's result has been written (1 = processed once).
pub async fn write_count(pool: &PgPool, job_id: &str) -> Result<Option<i32>, sqlx::Error> {
    let row = sqlx::query("SELECT write_count FROM detection_results WHERE job_id = $1")
        .bind(job_id)
        .fetch_optional(pool)
        .await?;

    row.map(|r| r.try_get("write_count")).transpose()
}
