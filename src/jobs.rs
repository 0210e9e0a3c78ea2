use crate::entities::{self, auth_code, device_code, refresh_token};
use crate::errors::GateError;
use crate::revocation::RevocationCache;
use crate::settings::Cleanup;
use crate::storage;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    IntoActiveModel, QueryFilter, Set,
};
use std::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

pub const CLEANUP_EXPIRED_CODES: &str = "cleanup_expired_codes";
pub const CLEANUP_EXPIRED_REFRESH_TOKENS: &str = "cleanup_expired_refresh_tokens";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub auth_codes: u64,
    pub device_codes: u64,
}

impl CleanupReport {
    pub fn total(&self) -> u64 {
        self.auth_codes + self.device_codes
    }
}

/// Delete authorization and device codes that expired more than `retention_buffer_secs` ago.
/// Codes inside the buffer are left for any exchange still in flight. Idempotent.
pub async fn cleanup_expired_codes<C: ConnectionTrait>(
    db: &C,
    now: i64,
    retention_buffer_secs: i64,
) -> Result<CleanupReport, GateError> {
    let cutoff = now - retention_buffer_secs;

    let auth = auth_code::Entity::delete_many()
        .filter(auth_code::Column::ExpiresAt.lt(cutoff))
        .exec(db)
        .await?;
    let device = device_code::Entity::delete_many()
        .filter(device_code::Column::ExpiresAt.lt(cutoff))
        .exec(db)
        .await?;

    Ok(CleanupReport {
        auth_codes: auth.rows_affected,
        device_codes: device.rows_affected,
    })
}

/// Refresh tokens past their own expiry can never be redeemed again.
pub async fn cleanup_expired_refresh_tokens<C: ConnectionTrait>(
    db: &C,
    now: i64,
    retention_buffer_secs: i64,
) -> Result<u64, GateError> {
    let result = refresh_token::Entity::delete_many()
        .filter(refresh_token::Column::ExpiresAt.lt(now - retention_buffer_secs))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

async fn run_job(db: &DatabaseConnection, job_name: &str, cfg: &Cleanup) -> Result<u64, GateError> {
    let now = storage::now();
    match job_name {
        CLEANUP_EXPIRED_CODES => Ok(cleanup_expired_codes(db, now, cfg.retention_buffer_secs)
            .await?
            .total()),
        CLEANUP_EXPIRED_REFRESH_TOKENS => {
            cleanup_expired_refresh_tokens(db, now, cfg.retention_buffer_secs).await
        }
        _ => Err(GateError::Other(format!("Unknown job name: {job_name}"))),
    }
}

/// Run a job and record the outcome in `job_executions`. Bookkeeping failures are logged and
/// never stop the job itself.
async fn run_logged(db: &DatabaseConnection, job_name: &str, cfg: &Cleanup) {
    info!("Running {} job", job_name);
    let execution_id = match start_job_execution(db, job_name).await {
        Ok(id) => Some(id),
        Err(e) => {
            error!(job = job_name, error = %e, "Failed to record job start");
            None
        }
    };

    let (success, error_message, records) = match run_job(db, job_name, cfg).await {
        Ok(count) => {
            info!(job = job_name, records = count, "Job completed");
            (true, None, Some(count as i64))
        }
        Err(e) => {
            error!(job = job_name, error = %e, "Job failed");
            (false, Some(e.to_string()), None)
        }
    };

    if let Some(id) = execution_id {
        if let Err(e) = complete_job_execution(db, id, success, error_message, records).await {
            error!(job = job_name, execution_id = id, error = %e, "Failed to record job completion");
        }
    }
}

/// Start the scheduler: the database sweeps plus an in-memory revocation purge, all on
/// the configured cleanup interval.
pub async fn init_scheduler(
    db: DatabaseConnection,
    cfg: Cleanup,
    revocations: RevocationCache,
) -> Result<JobScheduler, GateError> {
    let sched = JobScheduler::new()
        .await
        .map_err(|e| GateError::Other(format!("Failed to create job scheduler: {e}")))?;
    let every = Duration::from_secs(cfg.interval_secs.max(1));

    for job_name in [CLEANUP_EXPIRED_CODES, CLEANUP_EXPIRED_REFRESH_TOKENS] {
        let db = db.clone();
        let cfg = cfg.clone();
        let job = Job::new_repeated_async(every, move |_uuid, _l| {
            let db = db.clone();
            let cfg = cfg.clone();
            Box::pin(async move {
                run_logged(&db, job_name, &cfg).await;
            })
        })
        .map_err(|e| GateError::Other(format!("Failed to create {job_name} job: {e}")))?;
        sched
            .add(job)
            .await
            .map_err(|e| GateError::Other(format!("Failed to add {job_name} job: {e}")))?;
    }

    let purge = Job::new_repeated_async(every, move |_uuid, _l| {
        let revocations = revocations.clone();
        Box::pin(async move {
            revocations.purge_expired();
        })
    })
    .map_err(|e| GateError::Other(format!("Failed to create revocation purge job: {e}")))?;
    sched
        .add(purge)
        .await
        .map_err(|e| GateError::Other(format!("Failed to add revocation purge job: {e}")))?;

    sched
        .start()
        .await
        .map_err(|e| GateError::Other(format!("Failed to start job scheduler: {e}")))?;

    info!(interval_secs = every.as_secs(), "Job scheduler started with 3 jobs");
    Ok(sched)
}

pub async fn start_job_execution(
    db: &DatabaseConnection,
    job_name: &str,
) -> Result<i64, GateError> {
    use entities::job_execution;

    let execution = job_execution::ActiveModel {
        id: Set(0), // auto-generated
        job_name: Set(job_name.to_string()),
        started_at: Set(storage::now()),
        completed_at: Set(None),
        success: Set(None),
        error_message: Set(None),
        records_processed: Set(None),
    };

    let result = execution.insert(db).await?;
    Ok(result.id)
}

pub async fn complete_job_execution(
    db: &DatabaseConnection,
    execution_id: i64,
    success: bool,
    error_message: Option<String>,
    records_processed: Option<i64>,
) -> Result<(), GateError> {
    use entities::job_execution::{Column, Entity};

    let execution = Entity::find()
        .filter(Column::Id.eq(execution_id))
        .one(db)
        .await?
        .ok_or_else(|| GateError::NotFound(format!("job execution {execution_id}")))?;
    let mut active = execution.into_active_model();
    active.completed_at = Set(Some(storage::now()));
    active.success = Set(Some(if success { 1 } else { 0 }));
    active.error_message = Set(error_message);
    active.records_processed = Set(records_processed);
    active.update(db).await?;

    Ok(())
}

/// Run a job immediately by name, recording it like a scheduled run.
pub async fn trigger_job_manually(
    db: &DatabaseConnection,
    job_name: &str,
    cfg: &Cleanup,
) -> Result<u64, GateError> {
    info!("Manually triggering job: {}", job_name);
    let execution_id = start_job_execution(db, job_name).await?;

    match run_job(db, job_name, cfg).await {
        Ok(count) => {
            complete_job_execution(db, execution_id, true, None, Some(count as i64)).await?;
            Ok(count)
        }
        Err(e) => {
            error!("Manually triggered job {} failed: {}", job_name, e);
            complete_job_execution(db, execution_id, false, Some(e.to_string()), None).await?;
            Err(e)
        }
    }
}
