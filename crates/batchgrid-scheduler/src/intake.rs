//! Job intake: predict, persist, schedule.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use batchgrid_autoscale::{PredictionRequest, Predictor};
use batchgrid_state::{Job, JobStatus, JobType, StateStore, epoch_secs};

use crate::error::{SchedulerError, SchedulerResult};
use crate::scheduler::Scheduler;

/// Longest duration estimate accepted from the predictor, in seconds.
pub const MAX_PREDICTED_DURATION_SECS: i64 = 30 * 24 * 3600;

/// A job as submitted by a client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobRequest {
    pub executable_path: String,
    pub args: String,
    pub job_type: JobType,
    pub priority: i32,
    pub author: Option<u64>,
}

impl JobRequest {
    pub fn new(executable_path: impl Into<String>, priority: i32) -> Self {
        Self {
            executable_path: executable_path.into(),
            priority,
            ..Default::default()
        }
    }
}

pub struct SubmissionIntake {
    scheduler: Arc<Scheduler>,
    store: StateStore,
    predictor: Option<Arc<dyn Predictor>>,
}

impl SubmissionIntake {
    pub fn new(scheduler: Arc<Scheduler>, store: StateStore) -> Self {
        Self {
            scheduler,
            store,
            predictor: None,
        }
    }

    pub fn with_predictor(mut self, predictor: Arc<dyn Predictor>) -> Self {
        self.predictor = Some(predictor);
        self
    }

    /// Admit a new job. Without a reachable predictor the job is scheduled
    /// with a zero duration estimate.
    pub async fn submit(&self, request: JobRequest) -> SchedulerResult<Job> {
        let id = self.store.next_job_id()?;
        if request.priority < 0 {
            return Err(SchedulerError::InvalidPriority {
                job: id,
                priority: request.priority,
            });
        }

        let mut job = Job::new(id, request.executable_path, request.priority);
        job.args = request.args;
        job.job_type = request.job_type;
        job.author = request.author;

        if let Some(predictor) = &self.predictor {
            let prediction_request = PredictionRequest::for_job(&job.executable_path, &job.args);
            match predictor.request_prediction(&prediction_request).await {
                Ok(prediction) => {
                    let duration = prediction.duration.clamp(0, MAX_PREDICTED_DURATION_SECS);
                    if duration != prediction.duration {
                        warn!(
                            job = id,
                            predicted = prediction.duration,
                            clamped = duration,
                            "duration prediction out of range"
                        );
                    }
                    job.predicted_duration = duration;
                    job.failure_probability = prediction.failure_probability;
                }
                Err(e) => warn!(job = id, error = %e, "duration prediction failed"),
            }
        }

        self.store.put_job(&job)?;
        info!(
            job = id,
            priority = job.priority,
            predicted_duration = job.predicted_duration,
            "job accepted"
        );
        self.scheduler.schedule_job(job.clone()).await?;
        Ok(job)
    }

    /// Reschedule every job persisted as pending. Returns how many were
    /// scheduled; jobs the scheduler rejects are persisted as failed.
    pub async fn recover_pending(&self) -> SchedulerResult<usize> {
        let pending = self.store.pending_jobs()?;
        let total = pending.len();
        let mut scheduled = 0;
        for job in pending {
            let id = job.id;
            match self.scheduler.schedule_job(job.clone()).await {
                Ok(_) => scheduled += 1,
                Err(SchedulerError::InvalidPriority { .. }) => {
                    warn!(job = id, priority = job.priority, "pending job has invalid priority");
                    let mut job = job;
                    job.status = JobStatus::Failed;
                    job.updated_at = epoch_secs();
                    self.store.put_job(&job)?;
                }
                Err(e) => warn!(job = id, error = %e, "pending job could not be rescheduled"),
            }
        }
        info!(total, scheduled, "pending jobs recovered");
        Ok(scheduled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::tests::MockDeployer;
    use crate::scheduler::{Admission, LevelConfig};
    use batchgrid_autoscale::{Prediction, PredictorError, PredictorFuture};
    use batchgrid_state::PolicyRecord;

    struct FixedPredictor {
        fail: bool,
        duration: Option<i64>,
    }

    impl Predictor for FixedPredictor {
        fn request_prediction<'a>(
            &'a self,
            request: &'a PredictionRequest,
        ) -> PredictorFuture<'a, Prediction> {
            Box::pin(async move {
                if self.fail {
                    return Err(PredictorError::Timeout);
                }
                Ok(Prediction {
                    duration: self
                        .duration
                        .unwrap_or(request.executable_path.len() as i64 * 10),
                    failure_probability: 0.25,
                    ..Default::default()
                })
            })
        }

        fn collect_autoscaler_data<'a>(&'a self, _record: &'a PolicyRecord) -> PredictorFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }
    }

    fn intake(fail_predictor: bool) -> (SubmissionIntake, Arc<Scheduler>, Arc<MockDeployer>, StateStore) {
        intake_with(FixedPredictor {
            fail: fail_predictor,
            duration: None,
        })
    }

    fn intake_with(
        predictor: FixedPredictor,
    ) -> (SubmissionIntake, Arc<Scheduler>, Arc<MockDeployer>, StateStore) {
        let deployer = Arc::new(MockDeployer::default());
        let store = StateStore::open_in_memory().unwrap();
        let scheduler = Arc::new(
            Scheduler::new(
                vec![LevelConfig::default(), LevelConfig::default()],
                deployer.clone(),
                store.clone(),
            )
            .unwrap(),
        );
        let intake = SubmissionIntake::new(Arc::clone(&scheduler), store.clone())
            .with_predictor(Arc::new(predictor));
        (intake, scheduler, deployer, store)
    }

    #[tokio::test]
    async fn submit_predicts_persists_and_queues() {
        let (intake, scheduler, _, store) = intake(false);
        let job = intake.submit(JobRequest::new("gs://a.py", 1)).await.unwrap();

        assert_eq!(job.id, 1);
        assert_eq!(job.predicted_duration, 90);
        assert_eq!(job.failure_probability, 0.25);
        assert_eq!(store.get_job(1).unwrap().unwrap().status, JobStatus::Pending);
        assert_eq!(scheduler.bins(1).await.unwrap()[0].jobs[0].id, 1);
    }

    #[tokio::test]
    async fn prediction_failure_still_schedules() {
        let (intake, scheduler, _, _) = intake(true);
        let job = intake.submit(JobRequest::new("gs://a.py", 0)).await.unwrap();
        assert_eq!(job.predicted_duration, 0);
        assert_eq!(scheduler.bins(0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn out_of_range_predictions_are_clamped() {
        for (predicted, expected) in [
            (i64::MAX, MAX_PREDICTED_DURATION_SECS),
            (-500, 0),
            (120, 120),
        ] {
            let (intake, scheduler, _, store) = intake_with(FixedPredictor {
                fail: false,
                duration: Some(predicted),
            });
            let job = intake.submit(JobRequest::new("gs://a.py", 0)).await.unwrap();
            assert_eq!(job.predicted_duration, expected);
            assert_eq!(store.get_job(job.id).unwrap().unwrap().predicted_duration, expected);
            assert_eq!(scheduler.bins(0).await.unwrap()[0].jobs.len(), 1);
        }
    }

    #[tokio::test]
    async fn negative_priority_is_not_persisted() {
        let (intake, _, _, store) = intake(false);
        assert!(matches!(
            intake.submit(JobRequest::new("gs://a.py", -3)).await,
            Err(SchedulerError::InvalidPriority { priority: -3, .. })
        ));
        assert!(store.list_jobs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn pending_jobs_are_rescheduled_at_startup() {
        let (intake, scheduler, deployer, store) = intake(false);
        let mut queued = Job::new(1, "gs://a.py", 0);
        queued.predicted_duration = 10;
        let urgent = Job::new(2, "gs://b.py", 2);
        let broken = Job::new(3, "gs://c.py", -1);
        let mut done = Job::new(4, "gs://d.py", 0);
        done.status = JobStatus::Completed;
        store.put_jobs(&[queued, urgent, broken, done]).unwrap();

        assert_eq!(intake.recover_pending().await.unwrap(), 2);
        assert_eq!(scheduler.bins(0).await.unwrap()[0].jobs[0].id, 1);
        scheduler.wait_for_deployments().await;
        assert_eq!(deployer.batches(), vec![(vec![2], false)]);
        assert_eq!(store.get_job(3).unwrap().unwrap().status, JobStatus::Failed);
        assert_eq!(store.get_job(4).unwrap().unwrap().status, JobStatus::Completed);

        let admission = scheduler.schedule_job(Job::new(5, "gs://e.py", 0)).await.unwrap();
        assert_eq!(admission, Admission::Queued { level: 0, bin: 0 });
    }
}
