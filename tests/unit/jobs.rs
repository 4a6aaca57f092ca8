//! Upgrade job construction and job manager tests

use kube::ResourceExt;
use patroni_operator::config::OperatorConfig;
use patroni_operator::crd::UpgradePhase;
use patroni_operator::resources::common::MAINTENANCE_PORT;
use patroni_operator::upgrade::jobs::{
    DATA_PLANE_DEADLINE_SECONDS, DataPlaneJob, JobManager, JobProgress, PHASE_LABEL,
    WORKER_DEADLINE_SECONDS, WorkerJob, job_name,
};
use patroni_operator::upgrade::{Propagation, UpgradeError};
use patroni_operator::worker::WorkerMode;

use crate::common::*;

fn env_of(job: &k8s_openapi::api::batch::v1::Job, name: &str) -> Option<String> {
    job.spec.as_ref()?.template.spec.as_ref()?.containers[0]
        .env
        .as_ref()?
        .iter()
        .find(|e| e.name == name)?
        .value
        .clone()
}

mod worker_job_tests {
    use super::*;

    #[test]
    fn test_worker_job_targets_main_service() {
        let cluster = create_test_cluster("pg", "default", 3);
        let config = OperatorConfig::default();
        let job = WorkerJob::new(
            UpgradePhase::ReplicaSync,
            WorkerMode::ReplicaSync,
            MAINTENANCE_PORT,
        )
        .with_env("PAUSE", "true")
        .build(&cluster, 3, &config);

        assert_eq!(job.name_any(), "pg-replica-sync");
        assert_eq!(
            job.labels().get(PHASE_LABEL).map(String::as_str),
            Some("replica-sync")
        );
        assert_eq!(env_of(&job, "DBHOST").as_deref(), Some("pg"));
        assert_eq!(env_of(&job, "DBPORT").as_deref(), Some("55432"));
        assert_eq!(env_of(&job, "MODE").as_deref(), Some("replica-sync"));
        assert_eq!(env_of(&job, "CLUSTER_SIZE").as_deref(), Some("3"));
        assert_eq!(env_of(&job, "PAUSE").as_deref(), Some("true"));
    }

    #[test]
    fn test_worker_job_runs_once() {
        let cluster = create_test_cluster("pg", "default", 1);
        let config = OperatorConfig::default();
        let job = WorkerJob::new(UpgradePhase::CaptureConfig, WorkerMode::CaptureConfig, 5432)
            .build(&cluster, 1, &config);

        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        assert_eq!(spec.active_deadline_seconds, Some(WORKER_DEADLINE_SECONDS));
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(
            pod.containers[0].image.as_deref(),
            Some(config.worker_image.as_str())
        );
    }

    #[test]
    fn test_password_comes_from_secret() {
        let cluster = create_test_cluster("pg", "default", 1);
        let job = WorkerJob::new(UpgradePhase::PostUpgrade, WorkerMode::PostUpgrade, 5432)
            .build(&cluster, 1, &OperatorConfig::default());

        let pod = job.spec.unwrap().template.spec.unwrap();
        let password = pod.containers[0]
            .env
            .as_ref()
            .unwrap()
            .iter()
            .find(|e| e.name == "DBPASSWORD")
            .unwrap()
            .clone();
        assert!(password.value.is_none());
        let key_ref = password.value_from.unwrap().secret_key_ref.unwrap();
        assert_eq!(key_ref.name, "pg-credentials");
    }
}

mod data_plane_job_tests {
    use super::*;

    fn relocate_job() -> k8s_openapi::api::batch::v1::Job {
        let cluster = create_test_cluster("pg", "default", 3);
        DataPlaneJob {
            name: job_name("pg", UpgradePhase::PrimaryRelocate),
            phase: UpgradePhase::PrimaryRelocate,
            image: "postgres-patroni:test".to_string(),
            script: "echo relocated",
            claim_name: "pgdata-pg-1".to_string(),
            env: Vec::new(),
        }
        .with_env("OLD", "15")
        .with_env("NEW", "17")
        .build(&cluster)
    }

    #[test]
    fn test_data_plane_job_mounts_member_volume() {
        let job = relocate_job();

        let pod = job.spec.unwrap().template.spec.unwrap();
        let claim = pod.volumes.unwrap()[0]
            .persistent_volume_claim
            .clone()
            .unwrap();
        assert_eq!(claim.claim_name, "pgdata-pg-1");
        assert_eq!(
            pod.containers[0].command,
            Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo relocated".to_string()
            ])
        );
    }

    #[test]
    fn test_data_plane_job_retries_in_pod() {
        let job = relocate_job();

        assert_eq!(env_of(&job, "OLD").as_deref(), Some("15"));
        assert_eq!(env_of(&job, "NEW").as_deref(), Some("17"));
        let spec = job.spec.unwrap();
        assert_eq!(
            spec.active_deadline_seconds,
            Some(DATA_PLANE_DEADLINE_SECONDS)
        );
        assert_eq!(
            spec.template.spec.unwrap().restart_policy.as_deref(),
            Some("OnFailure")
        );
    }
}

mod job_manager_tests {
    use super::*;

    fn capture_job() -> k8s_openapi::api::batch::v1::Job {
        let cluster = create_test_cluster("pg", "default", 1);
        WorkerJob::new(UpgradePhase::CaptureConfig, WorkerMode::CaptureConfig, 5432).build(
            &cluster,
            1,
            &OperatorConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_ensure_creates_once() {
        let platform = FakePlatform::new();
        let jobs = JobManager::new(&platform);

        assert!(matches!(
            jobs.ensure(capture_job()).await.unwrap(),
            JobProgress::Created
        ));
        assert!(matches!(
            jobs.ensure(capture_job()).await.unwrap(),
            JobProgress::Running
        ));
        assert_eq!(platform.created_jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_ensure_reports_terminal_state() {
        let platform = FakePlatform::new();
        let jobs = JobManager::new(&platform);
        jobs.ensure(capture_job()).await.unwrap();

        platform.succeed_job("pg-capture-config", Some("{}"));
        let JobProgress::Succeeded(job) = jobs.ensure(capture_job()).await.unwrap() else {
            panic!("expected success");
        };
        assert_eq!(jobs.read_result(&job).await.unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_fail_deletes_job() {
        let platform = FakePlatform::new();
        let jobs = JobManager::new(&platform);
        jobs.ensure(capture_job()).await.unwrap();
        platform.fail_job("pg-capture-config");

        let Some(JobProgress::Failed(job)) = jobs.get("pg-capture-config").await.unwrap() else {
            panic!("expected failure");
        };
        let err = jobs.fail(UpgradePhase::CaptureConfig, &job).await;

        assert!(matches!(
            err,
            UpgradeError::JobFailed {
                phase: UpgradePhase::CaptureConfig,
                ..
            }
        ));
        assert!(jobs.get("pg-capture-config").await.unwrap().is_none());
        assert_eq!(
            platform.deleted_jobs(),
            vec![("pg-capture-config".to_string(), Propagation::Background)]
        );
    }

    #[tokio::test]
    async fn test_remove_of_absent_job_succeeds() {
        let platform = FakePlatform::new();
        JobManager::new(&platform)
            .remove("pg-post-upgrade", Propagation::Foreground)
            .await
            .unwrap();
    }
}
