//! Upgrade pipeline tests against the in-memory platform
//!
//! Each test drives [`Pipeline`] the way the reconciler does: one call per
//! pass, with the platform settling jobs and rollouts in between.

use k8s_openapi::api::batch::v1::Job;
use kube::ResourceExt;
use patroni_operator::config::OperatorConfig;
use patroni_operator::crd::{
    ClusterState, PatroniPostgres, PatroniPostgresStatus, UpgradePhase,
};
use patroni_operator::resources::patroni::{
    SYNC_LEADER_ANNOTATION, SYSTEM_ID_ANNOTATION, dcs_configmap_name,
};
use patroni_operator::upgrade::dcs::DYNAMIC_CONFIG_ANNOTATION;
use patroni_operator::upgrade::handlers::{MAX_SYNC_ROUNDS, streamer_name};
use patroni_operator::upgrade::jobs::{PHASE_LABEL, job_name, member_job_name};
use patroni_operator::upgrade::store::{
    LATEST_CHECKPOINT_LOCATION, PRIMARY_INIT_ARGS, SOURCE_SYSTEM_IDENTIFIER, SYNC_LEADER_INDEX,
    SYSTEM_IDENTIFIER,
};
use patroni_operator::upgrade::{Advance, CoordinationStore, Pipeline, Propagation, UpgradeError};

use crate::common::*;

const OLD_SYSTEM_ID: &str = "7100000000000000001";
const NEW_SYSTEM_ID: &str = "7400000000000000002";
const CAPTURED: &str =
    r#"{"locale":"C.UTF-8","encoding":"UTF8","dataChecksums":true,"maxPreparedTransactions":0}"#;
const SYNCED: &str = r#"{"lsn":"0/3000148","rounds":2}"#;

/// What a healthy worker prints for the job's phase
fn healthy_output(job: &Job) -> Option<String> {
    let phase: UpgradePhase = job.labels().get(PHASE_LABEL)?.parse().ok()?;
    match phase {
        UpgradePhase::CaptureConfig => Some(CAPTURED.to_string()),
        UpgradePhase::ReplicaSync => Some(SYNCED.to_string()),
        UpgradePhase::PrimaryUpgrade => Some(NEW_SYSTEM_ID.to_string()),
        _ => None,
    }
}

/// Run passes until the upgrade completes, returning the phases entered
async fn drive_to_completion(
    platform: &FakePlatform,
    config: &OperatorConfig,
    cluster: &PatroniPostgres,
    status: &mut PatroniPostgresStatus,
) -> Vec<UpgradePhase> {
    let pipeline = Pipeline::new(platform, config);
    let mut entered = Vec::new();
    for _ in 0..64 {
        match pipeline.advance(cluster, status).await.unwrap() {
            Advance::Pending(_) => {
                platform.complete_pending_jobs(healthy_output);
            }
            Advance::Advanced(phase) => entered.push(phase),
            Advance::Completed => return entered,
            Advance::Reset => panic!("pipeline reset during a healthy upgrade"),
        }
    }
    panic!("upgrade did not complete, stuck at {}", status.state);
}

async fn begin(
    platform: &FakePlatform,
    config: &OperatorConfig,
    cluster: &PatroniPostgres,
) -> PatroniPostgresStatus {
    let mut status = cluster.status.clone().unwrap();
    Pipeline::new(platform, config)
        .begin(cluster, &mut status)
        .await
        .unwrap();
    status
}

mod traversal_tests {
    use super::*;

    #[tokio::test]
    async fn test_three_node_upgrade_runs_every_phase_in_order() {
        let platform = FakePlatform::new();
        platform.seed_patroni("pg", 1, OLD_SYSTEM_ID);
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("pg", "default", 3, 15, 17);

        let mut status = begin(&platform, &config, &cluster).await;
        assert_eq!(
            status.cluster_state(),
            Some(ClusterState::Upgrade(UpgradePhase::CaptureConfig))
        );
        assert_eq!(status.upgrade_version, 17);

        let entered = drive_to_completion(&platform, &config, &cluster, &mut status).await;
        assert_eq!(entered, UpgradePhase::ALL[1..].to_vec());

        assert_eq!(status.cluster_state(), Some(ClusterState::Ready));
        assert_eq!(status.version, 17);
        assert_eq!(status.upgrade_version, 0);
        assert_eq!(status.ready, 3);
    }

    #[tokio::test]
    async fn test_three_node_upgrade_creates_one_job_per_step() {
        let platform = FakePlatform::new();
        platform.seed_patroni("pg", 1, OLD_SYSTEM_ID);
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("pg", "default", 3, 15, 17);

        let mut status = begin(&platform, &config, &cluster).await;
        drive_to_completion(&platform, &config, &cluster, &mut status).await;

        // The leader (member 1) is upgraded in place, the others are cloned
        assert_eq!(
            platform.created_jobs(),
            vec![
                job_name("pg", UpgradePhase::CaptureConfig),
                job_name("pg", UpgradePhase::ReplicaSync),
                job_name("pg", UpgradePhase::PrimaryUpgrade),
                member_job_name("pg", UpgradePhase::SecondaryUpgrade, 0),
                member_job_name("pg", UpgradePhase::SecondaryUpgrade, 2),
                job_name("pg", UpgradePhase::PrimaryRelocate),
                job_name("pg", UpgradePhase::PostUpgrade),
            ]
        );
        assert!(platform.job_names().is_empty(), "finished jobs are deleted");
    }

    #[tokio::test]
    async fn test_completed_upgrade_leaves_no_helpers_behind() {
        let platform = FakePlatform::new();
        platform.seed_patroni("pg", 1, OLD_SYSTEM_ID);
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("pg", "default", 3, 15, 17);

        let mut status = begin(&platform, &config, &cluster).await;
        drive_to_completion(&platform, &config, &cluster, &mut status).await;

        let store = CoordinationStore::new(&platform, &cluster);
        assert!(store.entries().await.unwrap().is_empty());
        assert!(platform.statefulset(&streamer_name("pg")).is_none());
        assert!(platform.service(&streamer_name("pg")).is_none());
    }

    #[tokio::test]
    async fn test_upgrade_restores_steady_workload_on_new_version() {
        let platform = FakePlatform::new();
        platform.seed_patroni("pg", 1, OLD_SYSTEM_ID);
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("pg", "default", 3, 15, 17);

        let mut status = begin(&platform, &config, &cluster).await;
        drive_to_completion(&platform, &config, &cluster, &mut status).await;

        let sts = platform.statefulset("pg").unwrap();
        let spec = sts.spec.unwrap();
        assert_eq!(spec.replicas, Some(3));

        let pod = spec.template.spec.unwrap();
        let container = &pod.containers[0];
        assert_eq!(
            container.image.as_deref(),
            config.images.for_version(17)
        );
        let env = container.env.as_ref().unwrap();
        let pg_version = env.iter().find(|e| e.name == "PG_VERSION").unwrap();
        assert_eq!(pg_version.value.as_deref(), Some("17"));
        // Back on the client port
        assert!(!env.iter().any(|e| e.name == "POSTGRESQL_PORT"));
    }

    #[tokio::test]
    async fn test_upgrade_publishes_new_identity_and_resumes_patroni() {
        let platform = FakePlatform::new();
        platform.seed_patroni("pg", 1, OLD_SYSTEM_ID);
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("pg", "default", 3, 15, 17);

        let mut status = begin(&platform, &config, &cluster).await;
        drive_to_completion(&platform, &config, &cluster, &mut status).await;

        let dcs_config = dcs_configmap_name("pg", "config");
        assert_eq!(
            platform.annotation(&dcs_config, SYSTEM_ID_ANNOTATION).as_deref(),
            Some(NEW_SYSTEM_ID)
        );

        let dynamic: serde_json::Value = serde_json::from_str(
            &platform
                .annotation(&dcs_config, DYNAMIC_CONFIG_ANNOTATION)
                .unwrap(),
        )
        .unwrap();
        assert!(dynamic.get("pause").is_none());
        assert_eq!(dynamic["ttl"], 30);
    }

    #[tokio::test]
    async fn test_single_node_upgrade_skips_replica_work() {
        let platform = FakePlatform::new();
        platform.seed_patroni("solo", 0, OLD_SYSTEM_ID);
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("solo", "default", 1, 15, 17);

        let mut status = begin(&platform, &config, &cluster).await;
        let entered = drive_to_completion(&platform, &config, &cluster, &mut status).await;

        assert_eq!(entered.len(), UpgradePhase::ALL.len() - 1);
        assert_eq!(status.version, 17);
        assert_eq!(
            platform.created_jobs(),
            vec![
                job_name("solo", UpgradePhase::CaptureConfig),
                job_name("solo", UpgradePhase::PrimaryUpgrade),
                job_name("solo", UpgradePhase::PrimaryRelocate),
                job_name("solo", UpgradePhase::PostUpgrade),
            ]
        );
    }
}

mod begin_tests {
    use super::*;

    #[tokio::test]
    async fn test_begin_records_sync_leader() {
        let platform = FakePlatform::new();
        platform.seed_patroni("pg", 2, OLD_SYSTEM_ID);
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("pg", "default", 3, 15, 17);

        begin(&platform, &config, &cluster).await;

        let store = CoordinationStore::new(&platform, &cluster);
        assert_eq!(store.sync_leader_index().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_begin_discards_leftovers_of_an_abandoned_attempt() {
        let platform = FakePlatform::new();
        platform.seed_patroni("pg", 0, OLD_SYSTEM_ID);
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("pg", "default", 3, 15, 17);

        let store = CoordinationStore::new(&platform, &cluster);
        store.set(LATEST_CHECKPOINT_LOCATION, "0/1000000").await.unwrap();
        store.set(SYSTEM_IDENTIFIER, "1").await.unwrap();

        begin(&platform, &config, &cluster).await;

        let entries = store.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries.get(SYNC_LEADER_INDEX).map(String::as_str), Some("0"));
    }

    #[tokio::test]
    async fn test_begin_without_sync_leader_leaves_cluster_ready() {
        let platform = FakePlatform::new();
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("pg", "default", 3, 15, 17);

        let mut status = cluster.status.clone().unwrap();
        let err = Pipeline::new(&platform, &config)
            .begin(&cluster, &mut status)
            .await
            .unwrap_err();

        assert!(matches!(err, UpgradeError::NoSyncLeader));
        assert!(err.is_retryable());
        assert_eq!(status.cluster_state(), Some(ClusterState::Ready));
        assert_eq!(status.upgrade_version, 0);
    }

    #[tokio::test]
    async fn test_begin_rejects_leader_outside_cluster() {
        let platform = FakePlatform::new();
        platform.seed_patroni("pg", 5, OLD_SYSTEM_ID);
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("pg", "default", 3, 15, 17);

        let mut status = cluster.status.clone().unwrap();
        let err = Pipeline::new(&platform, &config)
            .begin(&cluster, &mut status)
            .await
            .unwrap_err();

        assert!(matches!(err, UpgradeError::SyncLeaderOutOfRange { .. }));
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn test_begin_rejects_pair_without_shared_image() {
        let platform = FakePlatform::new();
        platform.seed_patroni("pg", 0, OLD_SYSTEM_ID);
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("pg", "default", 3, 13, 17);

        let mut status = cluster.status.clone().unwrap();
        let err = Pipeline::new(&platform, &config)
            .begin(&cluster, &mut status)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            UpgradeError::UnsupportedUpgrade { from: 13, to: 17 }
        ));
        assert_eq!(status.cluster_state(), Some(ClusterState::Ready));
    }
}

mod pass_tests {
    use super::*;

    #[tokio::test]
    async fn test_repeated_passes_do_not_duplicate_jobs() {
        let platform = FakePlatform::new();
        platform.seed_patroni("pg", 1, OLD_SYSTEM_ID);
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("pg", "default", 3, 15, 17);
        let pipeline = Pipeline::new(&platform, &config);

        let mut status = begin(&platform, &config, &cluster).await;
        for _ in 0..3 {
            assert_eq!(
                pipeline.advance(&cluster, &mut status).await.unwrap(),
                Advance::Pending(UpgradePhase::CaptureConfig)
            );
        }

        assert_eq!(
            platform.created_jobs(),
            vec![job_name("pg", UpgradePhase::CaptureConfig)]
        );
    }

    #[tokio::test]
    async fn test_unknown_state_restarts_pipeline() {
        let platform = FakePlatform::new();
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("pg", "default", 3, 15, 17);

        let mut status = upgrading_status("pg", 3, 15, 17, UpgradePhase::Quiesce);
        status.state = "defragment".to_string();

        let advance = Pipeline::new(&platform, &config)
            .advance(&cluster, &mut status)
            .await
            .unwrap();

        assert_eq!(advance, Advance::Reset);
        assert!(advance.requeue_now());
        assert_eq!(
            status.cluster_state(),
            Some(ClusterState::Upgrade(UpgradePhase::CaptureConfig))
        );
        assert!(platform.created_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_failed_job_is_deleted_and_phase_retried() {
        let platform = FakePlatform::new();
        platform.seed_patroni("pg", 1, OLD_SYSTEM_ID);
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("pg", "default", 3, 15, 17);
        let pipeline = Pipeline::new(&platform, &config);
        let name = job_name("pg", UpgradePhase::CaptureConfig);

        let mut status = begin(&platform, &config, &cluster).await;
        pipeline.advance(&cluster, &mut status).await.unwrap();
        platform.fail_job(&name);

        let err = pipeline.advance(&cluster, &mut status).await.unwrap_err();
        assert!(err.is_job_failure());
        assert!(platform.job(&name).is_none());
        assert_eq!(
            status.cluster_state(),
            Some(ClusterState::Upgrade(UpgradePhase::CaptureConfig))
        );

        // The next pass starts a fresh attempt
        pipeline.advance(&cluster, &mut status).await.unwrap();
        assert_eq!(platform.created_jobs(), vec![name.clone(), name]);
    }

    #[tokio::test]
    async fn test_prepared_transactions_block_the_upgrade() {
        let platform = FakePlatform::new();
        platform.seed_patroni("pg", 1, OLD_SYSTEM_ID);
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("pg", "default", 3, 15, 17);
        let pipeline = Pipeline::new(&platform, &config);
        let name = job_name("pg", UpgradePhase::CaptureConfig);

        let mut status = begin(&platform, &config, &cluster).await;
        pipeline.advance(&cluster, &mut status).await.unwrap();
        platform.succeed_job(
            &name,
            Some(r#"{"locale":"C","encoding":"UTF8","dataChecksums":false,"maxPreparedTransactions":10}"#),
        );

        let err = pipeline.advance(&cluster, &mut status).await.unwrap_err();
        assert!(matches!(err, UpgradeError::PreparedTransactions(10)));
        assert!(err.is_permanent());
        assert!(platform.job(&name).is_none());

        let store = CoordinationStore::new(&platform, &cluster);
        assert!(store.get(PRIMARY_INIT_ARGS).await.unwrap().is_none());
        assert_eq!(
            status.cluster_state(),
            Some(ClusterState::Upgrade(UpgradePhase::CaptureConfig))
        );
    }

    #[tokio::test]
    async fn test_malformed_output_keeps_job_for_inspection() {
        let platform = FakePlatform::new();
        platform.seed_patroni("pg", 1, OLD_SYSTEM_ID);
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("pg", "default", 3, 15, 17);
        let pipeline = Pipeline::new(&platform, &config);
        let name = job_name("pg", UpgradePhase::CaptureConfig);

        let mut status = begin(&platform, &config, &cluster).await;
        pipeline.advance(&cluster, &mut status).await.unwrap();
        platform.succeed_job(&name, Some("FATAL: could not connect"));

        let err = pipeline.advance(&cluster, &mut status).await.unwrap_err();
        assert!(err.is_malformed_result());
        assert!(platform.job(&name).is_some());
    }

    #[tokio::test]
    async fn test_missing_output_is_retried() {
        let platform = FakePlatform::new();
        platform.seed_patroni("pg", 1, OLD_SYSTEM_ID);
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("pg", "default", 3, 15, 17);
        let pipeline = Pipeline::new(&platform, &config);
        let name = job_name("pg", UpgradePhase::CaptureConfig);

        let mut status = begin(&platform, &config, &cluster).await;
        pipeline.advance(&cluster, &mut status).await.unwrap();
        platform.succeed_job(&name, None);

        let err = pipeline.advance(&cluster, &mut status).await.unwrap_err();
        assert!(matches!(err, UpgradeError::MissingResult { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_captured_config_becomes_init_args() {
        let platform = FakePlatform::new();
        platform.seed_patroni("pg", 1, OLD_SYSTEM_ID);
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("pg", "default", 3, 15, 17);
        let pipeline = Pipeline::new(&platform, &config);

        let mut status = begin(&platform, &config, &cluster).await;
        pipeline.advance(&cluster, &mut status).await.unwrap();
        platform.succeed_job(&job_name("pg", UpgradePhase::CaptureConfig), Some(CAPTURED));

        assert_eq!(
            pipeline.advance(&cluster, &mut status).await.unwrap(),
            Advance::Advanced(UpgradePhase::Quiesce)
        );
        let store = CoordinationStore::new(&platform, &cluster);
        assert_eq!(
            store.get(PRIMARY_INIT_ARGS).await.unwrap().as_deref(),
            Some("--locale=C.UTF-8 --encoding=UTF8 --data-checksums")
        );
    }
}

mod workload_tests {
    use super::*;

    #[tokio::test]
    async fn test_quiesce_waits_for_members_on_maintenance_port() {
        let platform = FakePlatform::new();
        platform.hold_rollouts(true);
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("pg", "default", 3, 15, 17);
        let pipeline = Pipeline::new(&platform, &config);
        let mut status = upgrading_status("pg", 3, 15, 17, UpgradePhase::Quiesce);

        assert_eq!(
            pipeline.advance(&cluster, &mut status).await.unwrap(),
            Advance::Pending(UpgradePhase::Quiesce)
        );

        let env = platform.statefulset("pg").unwrap().spec.unwrap().template.spec.unwrap()
            .containers[0]
            .env
            .clone()
            .unwrap();
        let port = env.iter().find(|e| e.name == "POSTGRESQL_PORT").unwrap();
        assert_eq!(port.value.as_deref(), Some("55432"));

        platform.set_ready_replicas("pg", 2);
        assert_eq!(
            pipeline.advance(&cluster, &mut status).await.unwrap(),
            Advance::Pending(UpgradePhase::Quiesce)
        );

        platform.set_ready_replicas("pg", 3);
        assert_eq!(
            pipeline.advance(&cluster, &mut status).await.unwrap(),
            Advance::Advanced(UpgradePhase::ReplicaSync)
        );
    }

    #[tokio::test]
    async fn test_scale_down_waits_until_no_member_runs() {
        let platform = FakePlatform::new();
        platform.hold_rollouts(true);
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("pg", "default", 3, 15, 17);
        let pipeline = Pipeline::new(&platform, &config);
        let mut status = upgrading_status("pg", 3, 15, 17, UpgradePhase::ScaleDown);

        assert_eq!(
            pipeline.advance(&cluster, &mut status).await.unwrap(),
            Advance::Pending(UpgradePhase::ScaleDown)
        );
        assert_eq!(
            platform.statefulset("pg").unwrap().spec.unwrap().replicas,
            Some(0)
        );

        platform.set_ready_replicas("pg", 0);
        assert_eq!(
            pipeline.advance(&cluster, &mut status).await.unwrap(),
            Advance::Advanced(UpgradePhase::PrimaryUpgrade)
        );
    }

    #[tokio::test]
    async fn test_post_upgrade_waits_for_members_before_worker() {
        let platform = FakePlatform::new();
        platform.seed_patroni("pg", 0, NEW_SYSTEM_ID);
        platform.hold_rollouts(true);
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("pg", "default", 3, 15, 17);
        let pipeline = Pipeline::new(&platform, &config);
        let mut status = upgrading_status("pg", 3, 17, 17, UpgradePhase::PostUpgrade);

        assert_eq!(
            pipeline.advance(&cluster, &mut status).await.unwrap(),
            Advance::Pending(UpgradePhase::PostUpgrade)
        );
        assert!(platform.created_jobs().is_empty());

        // Resumed before the members start
        let dynamic = platform
            .annotation(&dcs_configmap_name("pg", "config"), DYNAMIC_CONFIG_ANNOTATION)
            .unwrap();
        assert!(!dynamic.contains("pause"));

        platform.set_ready_replicas("pg", 3);
        assert_eq!(
            pipeline.advance(&cluster, &mut status).await.unwrap(),
            Advance::Pending(UpgradePhase::PostUpgrade)
        );
        assert_eq!(
            platform.created_jobs(),
            vec![job_name("pg", UpgradePhase::PostUpgrade)]
        );
    }
}

mod single_node_tests {
    use super::*;

    #[tokio::test]
    async fn test_replica_sync_is_a_no_op() {
        let platform = FakePlatform::new();
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("solo", "default", 1, 15, 17);
        let mut status = upgrading_status("solo", 1, 15, 17, UpgradePhase::ReplicaSync);

        let advance = Pipeline::new(&platform, &config)
            .advance(&cluster, &mut status)
            .await
            .unwrap();

        assert_eq!(advance, Advance::Advanced(UpgradePhase::ScaleDown));
        assert!(platform.created_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_secondary_upgrade_is_a_no_op() {
        let platform = FakePlatform::new();
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("solo", "default", 1, 15, 17);
        let mut status = upgrading_status("solo", 1, 15, 17, UpgradePhase::SecondaryUpgrade);

        let advance = Pipeline::new(&platform, &config)
            .advance(&cluster, &mut status)
            .await
            .unwrap();

        assert_eq!(advance, Advance::Advanced(UpgradePhase::PrimaryRelocate));
        assert!(platform.created_jobs().is_empty());
        assert!(platform.statefulset(&streamer_name("solo")).is_none());
    }
}

mod secondary_upgrade_tests {
    use super::*;

    async fn prepared(platform: &FakePlatform, cluster: &PatroniPostgres) {
        let store = CoordinationStore::new(platform, cluster);
        store.set(SYNC_LEADER_INDEX, "0").await.unwrap();
        store.set(LATEST_CHECKPOINT_LOCATION, "0/3000148").await.unwrap();
        store.set(SYSTEM_IDENTIFIER, NEW_SYSTEM_ID).await.unwrap();
    }

    #[tokio::test]
    async fn test_streamer_serves_leader_volume() {
        let platform = FakePlatform::new();
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("pg", "default", 3, 15, 17);
        prepared(&platform, &cluster).await;
        let mut status = upgrading_status("pg", 3, 15, 17, UpgradePhase::SecondaryUpgrade);

        Pipeline::new(&platform, &config)
            .advance(&cluster, &mut status)
            .await
            .unwrap();

        let streamer = platform.statefulset(&streamer_name("pg")).unwrap();
        let pod = streamer.spec.unwrap().template.spec.unwrap();
        let claim = pod.volumes.unwrap()[0]
            .persistent_volume_claim
            .clone()
            .unwrap()
            .claim_name;
        assert_eq!(claim, "pgdata-pg-0");
        assert!(platform.service(&streamer_name("pg")).is_some());
    }

    #[tokio::test]
    async fn test_one_clone_job_per_replica() {
        let platform = FakePlatform::new();
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("pg", "default", 3, 15, 17);
        prepared(&platform, &cluster).await;
        let mut status = upgrading_status("pg", 3, 15, 17, UpgradePhase::SecondaryUpgrade);

        let advance = Pipeline::new(&platform, &config)
            .advance(&cluster, &mut status)
            .await
            .unwrap();

        assert_eq!(advance, Advance::Pending(UpgradePhase::SecondaryUpgrade));
        assert_eq!(
            platform.created_jobs(),
            vec![
                member_job_name("pg", UpgradePhase::SecondaryUpgrade, 1),
                member_job_name("pg", UpgradePhase::SecondaryUpgrade, 2),
            ]
        );

        let job = platform
            .job(&member_job_name("pg", UpgradePhase::SecondaryUpgrade, 2))
            .unwrap();
        let pod = job.spec.unwrap().template.spec.unwrap();
        let env = pod.containers[0].env.clone().unwrap();
        let checkpoint = env.iter().find(|e| e.name == "DB_CHECKPOINT").unwrap();
        assert_eq!(checkpoint.value.as_deref(), Some("0/3000148"));
        let claim = pod.volumes.unwrap()[0]
            .persistent_volume_claim
            .clone()
            .unwrap()
            .claim_name;
        assert_eq!(claim, "pgdata-pg-2");
    }

    #[tokio::test]
    async fn test_failed_clone_leaves_sibling_running() {
        let platform = FakePlatform::new();
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("pg", "default", 3, 15, 17);
        prepared(&platform, &cluster).await;
        let pipeline = Pipeline::new(&platform, &config);
        let mut status = upgrading_status("pg", 3, 15, 17, UpgradePhase::SecondaryUpgrade);
        let failing = member_job_name("pg", UpgradePhase::SecondaryUpgrade, 1);
        let sibling = member_job_name("pg", UpgradePhase::SecondaryUpgrade, 2);

        pipeline.advance(&cluster, &mut status).await.unwrap();
        platform.fail_job(&failing);

        let err = pipeline.advance(&cluster, &mut status).await.unwrap_err();
        match err {
            UpgradeError::JobFailed { phase, job } => {
                assert_eq!(phase, UpgradePhase::SecondaryUpgrade);
                assert_eq!(job, failing);
            }
            other => panic!("unexpected error: {}", other),
        }

        assert!(platform.job(&failing).is_none());
        assert!(
            platform
                .deleted_jobs()
                .contains(&(failing.clone(), Propagation::Foreground))
        );
        let untouched = platform.job(&sibling).unwrap();
        assert!(untouched.status.is_none());
        assert!(platform.statefulset(&streamer_name("pg")).is_some());

        // Only the failed member is retried
        pipeline.advance(&cluster, &mut status).await.unwrap();
        let created = platform.created_jobs();
        assert_eq!(created.iter().filter(|n| **n == failing).count(), 2);
        assert_eq!(created.iter().filter(|n| **n == sibling).count(), 1);
    }

    #[tokio::test]
    async fn test_streamer_stays_until_every_clone_succeeds() {
        let platform = FakePlatform::new();
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("pg", "default", 3, 15, 17);
        prepared(&platform, &cluster).await;
        let pipeline = Pipeline::new(&platform, &config);
        let mut status = upgrading_status("pg", 3, 15, 17, UpgradePhase::SecondaryUpgrade);

        pipeline.advance(&cluster, &mut status).await.unwrap();
        platform.succeed_job(
            &member_job_name("pg", UpgradePhase::SecondaryUpgrade, 1),
            None,
        );
        assert_eq!(
            pipeline.advance(&cluster, &mut status).await.unwrap(),
            Advance::Pending(UpgradePhase::SecondaryUpgrade)
        );
        assert!(platform.statefulset(&streamer_name("pg")).is_some());

        platform.succeed_job(
            &member_job_name("pg", UpgradePhase::SecondaryUpgrade, 2),
            None,
        );
        assert_eq!(
            pipeline.advance(&cluster, &mut status).await.unwrap(),
            Advance::Advanced(UpgradePhase::PrimaryRelocate)
        );
        assert!(platform.statefulset(&streamer_name("pg")).is_none());
        assert!(platform.service(&streamer_name("pg")).is_none());
        assert!(platform.job_names().is_empty());
    }

    #[tokio::test]
    async fn test_missing_checkpoint_is_a_precondition() {
        let platform = FakePlatform::new();
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("pg", "default", 3, 15, 17);
        let store = CoordinationStore::new(&platform, &cluster);
        store.set(SYNC_LEADER_INDEX, "0").await.unwrap();
        let mut status = upgrading_status("pg", 3, 15, 17, UpgradePhase::SecondaryUpgrade);

        let err = Pipeline::new(&platform, &config)
            .advance(&cluster, &mut status)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            UpgradeError::MissingCoordinationKey(LATEST_CHECKPOINT_LOCATION)
        ));
        assert!(platform.created_jobs().is_empty());
    }
}

mod relocate_tests {
    use super::*;

    #[tokio::test]
    async fn test_version_commits_when_relocation_succeeds() {
        let platform = FakePlatform::new();
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("pg", "default", 3, 15, 17);
        let store = CoordinationStore::new(&platform, &cluster);
        store.set(SYNC_LEADER_INDEX, "1").await.unwrap();
        let pipeline = Pipeline::new(&platform, &config);
        let mut status = upgrading_status("pg", 3, 15, 17, UpgradePhase::PrimaryRelocate);

        pipeline.advance(&cluster, &mut status).await.unwrap();
        assert_eq!(status.version, 15);

        platform.succeed_job(&job_name("pg", UpgradePhase::PrimaryRelocate), None);
        assert_eq!(
            pipeline.advance(&cluster, &mut status).await.unwrap(),
            Advance::Advanced(UpgradePhase::PostUpgrade)
        );
        assert_eq!(status.version, 17);
        assert_eq!(status.upgrade_version, 17);
    }

    #[tokio::test]
    async fn test_missing_volume_status_is_a_precondition() {
        let platform = FakePlatform::new();
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("pg", "default", 3, 15, 17);
        let store = CoordinationStore::new(&platform, &cluster);
        store.set(SYNC_LEADER_INDEX, "2").await.unwrap();
        let mut status = upgrading_status("pg", 3, 15, 17, UpgradePhase::PrimaryRelocate);
        status.volume_statuses.truncate(2);

        let err = Pipeline::new(&platform, &config)
            .advance(&cluster, &mut status)
            .await
            .unwrap_err();

        assert!(matches!(err, UpgradeError::MissingVolumeStatus(2)));
        assert!(err.is_permanent());
    }
}

mod resume_tests {
    use super::*;

    /// Run passes until the cluster sits in `phase` without having run it
    async fn drive_until(
        platform: &FakePlatform,
        pipeline: &Pipeline<'_, FakePlatform>,
        cluster: &PatroniPostgres,
        status: &mut PatroniPostgresStatus,
        phase: UpgradePhase,
    ) {
        for _ in 0..64 {
            if status.cluster_state() == Some(ClusterState::Upgrade(phase)) {
                return;
            }
            if let Advance::Pending(_) = pipeline.advance(cluster, status).await.unwrap() {
                platform.complete_pending_jobs(healthy_output);
            }
        }
        panic!("never reached {}, stuck at {}", phase, status.state);
    }

    fn job_env(job: &Job, name: &str) -> Option<String> {
        let pod = job.spec.clone()?.template.spec?;
        pod.containers[0]
            .env
            .clone()?
            .into_iter()
            .find(|e| e.name == name)?
            .value
    }

    fn job_claim(job: &Job) -> String {
        let pod = job.spec.clone().unwrap().template.spec.unwrap();
        pod.volumes.unwrap()[0]
            .persistent_volume_claim
            .clone()
            .unwrap()
            .claim_name
    }

    #[tokio::test]
    async fn test_leader_moving_during_quiesce_is_followed() {
        let platform = FakePlatform::new();
        platform.seed_patroni("pg", 1, OLD_SYSTEM_ID);
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("pg", "default", 3, 15, 17);
        let pipeline = Pipeline::new(&platform, &config);
        let mut status = begin(&platform, &config, &cluster).await;

        drive_until(&platform, &pipeline, &cluster, &mut status, UpgradePhase::Quiesce).await;
        // Patroni hands leadership to another member before it is paused
        platform.insert_configmap(
            &dcs_configmap_name("pg", "sync"),
            &[(SYNC_LEADER_ANNOTATION, "pg-2")],
        );
        drive_until(
            &platform,
            &pipeline,
            &cluster,
            &mut status,
            UpgradePhase::PrimaryUpgrade,
        )
        .await;

        let store = CoordinationStore::new(&platform, &cluster);
        assert_eq!(store.sync_leader_index().await.unwrap(), 2);

        assert_eq!(
            pipeline.advance(&cluster, &mut status).await.unwrap(),
            Advance::Pending(UpgradePhase::PrimaryUpgrade)
        );
        let job = platform
            .job(&job_name("pg", UpgradePhase::PrimaryUpgrade))
            .unwrap();
        assert_eq!(job_claim(&job), "pgdata-pg-2");
    }

    #[tokio::test]
    async fn test_primary_upgrade_is_not_repeated_after_lost_status_write() {
        let platform = FakePlatform::new();
        platform.seed_patroni("pg", 0, OLD_SYSTEM_ID);
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("pg", "default", 3, 15, 17);
        let pipeline = Pipeline::new(&platform, &config);
        let mut status = begin(&platform, &config, &cluster).await;
        drive_until(
            &platform,
            &pipeline,
            &cluster,
            &mut status,
            UpgradePhase::PrimaryUpgrade,
        )
        .await;

        let name = job_name("pg", UpgradePhase::PrimaryUpgrade);
        pipeline.advance(&cluster, &mut status).await.unwrap();
        let job = platform.job(&name).unwrap();
        assert_eq!(job_env(&job, "DB_SYSTEM_ID").as_deref(), Some(OLD_SYSTEM_ID));

        // The reconciler's status write after this pass never lands
        let stale = status.clone();
        platform.succeed_job(&name, Some(NEW_SYSTEM_ID));
        assert_eq!(
            pipeline.advance(&cluster, &mut status).await.unwrap(),
            Advance::Advanced(UpgradePhase::SecondaryUpgrade)
        );
        assert!(platform.job(&name).is_none());

        let mut status = stale;
        assert_eq!(
            pipeline.advance(&cluster, &mut status).await.unwrap(),
            Advance::Advanced(UpgradePhase::SecondaryUpgrade)
        );
        assert_eq!(
            platform
                .created_jobs()
                .iter()
                .filter(|n| **n == name)
                .count(),
            1
        );

        let store = CoordinationStore::new(&platform, &cluster);
        assert_eq!(
            store.get(SOURCE_SYSTEM_IDENTIFIER).await.unwrap().as_deref(),
            Some(OLD_SYSTEM_ID)
        );
        assert_eq!(
            store.get(SYSTEM_IDENTIFIER).await.unwrap().as_deref(),
            Some(NEW_SYSTEM_ID)
        );
        assert_eq!(
            platform
                .annotation(&dcs_configmap_name("pg", "config"), SYSTEM_ID_ANNOTATION)
                .as_deref(),
            Some(NEW_SYSTEM_ID)
        );
    }

    #[tokio::test]
    async fn test_unfinished_primary_upgrade_job_is_awaited() {
        let platform = FakePlatform::new();
        platform.seed_patroni("pg", 0, OLD_SYSTEM_ID);
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("pg", "default", 3, 15, 17);
        let store = CoordinationStore::new(&platform, &cluster);
        store.set(SYNC_LEADER_INDEX, "0").await.unwrap();
        store.set(PRIMARY_INIT_ARGS, "--locale=C").await.unwrap();
        store.set(SOURCE_SYSTEM_IDENTIFIER, OLD_SYSTEM_ID).await.unwrap();
        let pipeline = Pipeline::new(&platform, &config);
        let mut status = upgrading_status("pg", 3, 15, 17, UpgradePhase::PrimaryUpgrade);

        let name = job_name("pg", UpgradePhase::PrimaryUpgrade);
        pipeline.advance(&cluster, &mut status).await.unwrap();
        // A stored identifier alone does not end the phase while its job runs
        store.set(SYSTEM_IDENTIFIER, NEW_SYSTEM_ID).await.unwrap();

        assert_eq!(
            pipeline.advance(&cluster, &mut status).await.unwrap(),
            Advance::Pending(UpgradePhase::PrimaryUpgrade)
        );
        platform.succeed_job(&name, Some(NEW_SYSTEM_ID));
        assert_eq!(
            pipeline.advance(&cluster, &mut status).await.unwrap(),
            Advance::Advanced(UpgradePhase::SecondaryUpgrade)
        );
        assert!(platform.job(&name).is_none());
    }

    #[tokio::test]
    async fn test_secondary_upgrade_reentered_after_streamer_teardown() {
        let platform = FakePlatform::new();
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("pg", "default", 3, 15, 17);
        let store = CoordinationStore::new(&platform, &cluster);
        store.set(SYNC_LEADER_INDEX, "0").await.unwrap();
        store.set(LATEST_CHECKPOINT_LOCATION, "0/3000148").await.unwrap();
        store.set(SYSTEM_IDENTIFIER, NEW_SYSTEM_ID).await.unwrap();
        let pipeline = Pipeline::new(&platform, &config);
        let mut status = upgrading_status("pg", 3, 15, 17, UpgradePhase::SecondaryUpgrade);

        pipeline.advance(&cluster, &mut status).await.unwrap();
        let stale = status.clone();
        platform.complete_pending_jobs(|_| None);
        assert_eq!(
            pipeline.advance(&cluster, &mut status).await.unwrap(),
            Advance::Advanced(UpgradePhase::PrimaryRelocate)
        );
        assert!(platform.statefulset(&streamer_name("pg")).is_none());

        let mut status = stale;
        assert_eq!(
            pipeline.advance(&cluster, &mut status).await.unwrap(),
            Advance::Pending(UpgradePhase::SecondaryUpgrade)
        );
        assert!(platform.statefulset(&streamer_name("pg")).is_some());
        assert_eq!(platform.job_names().len(), 2);

        platform.complete_pending_jobs(|_| None);
        assert_eq!(
            pipeline.advance(&cluster, &mut status).await.unwrap(),
            Advance::Advanced(UpgradePhase::PrimaryRelocate)
        );
        assert!(platform.statefulset(&streamer_name("pg")).is_none());
        assert!(platform.job_names().is_empty());
    }

    #[tokio::test]
    async fn test_replica_sync_job_carries_round_limit() {
        let platform = FakePlatform::new();
        let config = OperatorConfig::default();
        let cluster = create_upgradable_cluster("pg", "default", 3, 15, 17);
        let mut status = upgrading_status("pg", 3, 15, 17, UpgradePhase::ReplicaSync);

        Pipeline::new(&platform, &config)
            .advance(&cluster, &mut status)
            .await
            .unwrap();

        let job = platform
            .job(&job_name("pg", UpgradePhase::ReplicaSync))
            .unwrap();
        assert_eq!(
            job_env(&job, "SYNC_MAX_ROUNDS"),
            Some(MAX_SYNC_ROUNDS.to_string())
        );
    }
}
