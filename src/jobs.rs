use crate::entities;
use crate::errors::TollgateError;
use crate::settings::Jobs;
use crate::storage;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    Set,
};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

pub const CLEANUP_EXPIRED_TOKENS: &str = "cleanup_expired_tokens";
pub const RECONCILE_ACTIVATION_COUNTS: &str = "reconcile_activation_counts";

/// Initialize and start the job scheduler with all background tasks
pub async fn init_scheduler(
    db: DatabaseConnection,
    cfg: &Jobs,
) -> Result<JobScheduler, TollgateError> {
    let sched = JobScheduler::new()
        .await
        .map_err(|e| TollgateError::Other(format!("Failed to create job scheduler: {}", e)))?;

    for (name, schedule) in [
        (CLEANUP_EXPIRED_TOKENS, cfg.token_cleanup.as_str()),
        (RECONCILE_ACTIVATION_COUNTS, cfg.activation_reconcile.as_str()),
    ] {
        let db = db.clone();
        let job = Job::new_async(schedule, move |_uuid, _l| {
            let db = db.clone();
            Box::pin(async move {
                if let Err(e) = run_job(&db, name).await {
                    error!("Failed to record {} execution: {}", name, e);
                }
            })
        })
        .map_err(|e| TollgateError::Other(format!("Failed to create {} job: {}", name, e)))?;

        sched
            .add(job)
            .await
            .map_err(|e| TollgateError::Other(format!("Failed to add {} job: {}", name, e)))?;
    }

    sched
        .start()
        .await
        .map_err(|e| TollgateError::Other(format!("Failed to start job scheduler: {}", e)))?;

    info!("Job scheduler started with {} jobs", 2);

    Ok(sched)
}

/// Run a job by name and record the outcome in `job_executions`.
///
/// Job failures are recorded, not returned; only bookkeeping errors are.
pub async fn run_job(db: &DatabaseConnection, job_name: &str) -> Result<(), TollgateError> {
    info!("Running {} job", job_name);
    let execution_id = start_job_execution(db, job_name).await?;

    let result = match job_name {
        CLEANUP_EXPIRED_TOKENS => storage::cleanup_expired_tokens(db, Utc::now()).await,
        RECONCILE_ACTIVATION_COUNTS => storage::reconcile_activation_counts(db).await,
        _ => Err(TollgateError::Other(format!("Unknown job name: {}", job_name))),
    };

    match result {
        Ok(count) => {
            info!("Job {} completed: {} records", job_name, count);
            complete_job_execution(db, execution_id, true, None, Some(count as i64)).await?;
        }
        Err(e) => {
            error!("Job {} failed: {}", job_name, e);
            complete_job_execution(db, execution_id, false, Some(e.to_string()), None).await?;
        }
    }

    Ok(())
}

/// Record the start of a job execution
pub async fn start_job_execution(
    db: &DatabaseConnection,
    job_name: &str,
) -> Result<i64, TollgateError> {
    use entities::job_execution;

    let now = Utc::now().timestamp();

    let execution = job_execution::ActiveModel {
        job_name: Set(job_name.to_string()),
        started_at: Set(now),
        completed_at: Set(None),
        success: Set(None),
        error_message: Set(None),
        records_processed: Set(None),
        ..Default::default()
    };

    let result = execution.insert(db).await?;
    Ok(result.id)
}

/// Record the completion of a job execution
pub async fn complete_job_execution(
    db: &DatabaseConnection,
    execution_id: i64,
    success: bool,
    error_message: Option<String>,
    records_processed: Option<i64>,
) -> Result<(), TollgateError> {
    use entities::job_execution::{Column, Entity};

    let now = Utc::now().timestamp();

    if let Some(execution) = Entity::find()
        .filter(Column::Id.eq(execution_id))
        .one(db)
        .await?
    {
        let mut active: entities::job_execution::ActiveModel = execution.into_active_model();
        active.completed_at = Set(Some(now));
        active.success = Set(Some(if success { 1 } else { 0 }));
        active.error_message = Set(error_message);
        active.records_processed = Set(records_processed);
        active.update(db).await?;
    }

    Ok(())
}
