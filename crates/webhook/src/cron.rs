//! Background maintenance schedules.

use std::sync::Arc;

use anyhow::Result;
use lighthouse_keeper::History;
use tokio_cron_scheduler::{Job, JobScheduler};

pub type Scheduler = JobScheduler;

/// Periodic best-effort history flush to the blob store.
pub async fn create(history: Arc<History>) -> Result<Scheduler> {
    let sched = JobScheduler::new().await?;
    sched
        .add(Job::new_async("0 1/5 * * * *", move |_uuid, _l| {
            let history = history.clone();
            Box::pin(async move {
                history.flush().await;
            })
        })?)
        .await?;
    sched.start().await?;
    Ok(sched)
}
