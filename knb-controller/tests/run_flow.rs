//! Whole runs against the scripted control plane.

use knb_controller::cluster::{POD_IP, POD_PHASE, RUN_RESOURCE_KINDS, SERVICE_IP};
use knb_controller::labels::RUN_LABEL_MAX;
use knb_controller::{RunError, Topology};
use knb_devkit::{MockAgents, MockCluster, Reply, TestHarness};

fn pod2pod() -> Topology {
    Topology::PodToPod { port_policy: false }
}

fn phases(phases: &[&str]) -> Vec<Reply> {
    phases.iter().map(|p| Reply::line(p)).collect()
}

async fn harness(cluster: MockCluster) -> TestHarness {
    TestHarness::new(cluster, MockAgents::new()).await.unwrap()
}

#[tokio::test(start_paused = true)]
async fn pod2pod_run_succeeds() {
    let cluster = MockCluster::new()
        .with_pod_field(POD_IP, vec![Reply::not_ready(), Reply::line("10.0.0.7")])
        .with_pod_field(POD_PHASE, phases(&["Running", "Running", "Succeeded"]));
    let h = harness(cluster).await;

    let run = h.controller().new_run(TestHarness::spec(pod2pod())).await.unwrap();
    let run_id = run.run_id().to_string();
    assert!(run_id.starts_with("pod2pod-"));
    let report = run.execute().await;

    assert!(report.outcome.is_ok(), "{:?}", report.outcome);
    assert!(report.teardown.is_empty());
    assert_eq!(h.cluster.submitted(), vec!["server.yaml", "client.yaml"]);
    assert_eq!(h.cluster.pod_queries(POD_IP), 2);
    assert_eq!(h.cluster.pod_queries(POD_PHASE), 3);

    let client = h.cluster.manifest("client.yaml").unwrap();
    assert!(client.contains("10.0.0.7"));

    assert_eq!(
        h.cluster.log_fetches(),
        vec![format!("knb-runid={run_id},role=srv"), format!("knb-runid={run_id},role=cli")]
    );
    let srv_log = std::fs::read_to_string(report.dir.join("srv.log")).unwrap();
    assert_eq!(srv_log, format!("logs of knb-runid={run_id},role=srv\n"));
    assert!(report.dir.join("cli.log").exists());

    let kinds: Vec<String> = RUN_RESOURCE_KINDS.iter().map(|k| k.to_string()).collect();
    assert_eq!(h.cluster.deletes(), vec![(kinds, format!("knb-runid={run_id}"))]);
}

#[tokio::test(start_paused = true)]
async fn readiness_stops_at_first_address() {
    let mut replies = vec![Reply::not_ready(); 4];
    replies.push(Reply::line("10.0.0.9"));
    let cluster = MockCluster::new()
        .with_pod_field(POD_IP, replies)
        .with_pod_field(POD_PHASE, phases(&["Succeeded"]));
    let h = harness(cluster).await;

    let report = h
        .controller()
        .new_run(TestHarness::spec(pod2pod()))
        .await
        .unwrap()
        .execute()
        .await;

    assert!(report.outcome.is_ok());
    assert_eq!(h.cluster.pod_queries(POD_IP), 5);
}

#[tokio::test(start_paused = true)]
async fn query_errors_count_as_not_ready() {
    let cluster = MockCluster::new()
        .with_pod_field(POD_IP, vec![Reply::fail("connection refused"), Reply::line("10.0.0.9")])
        .with_pod_field(POD_PHASE, phases(&["Succeeded"]));
    let h = harness(cluster).await;

    let report = h
        .controller()
        .new_run(TestHarness::spec(pod2pod()))
        .await
        .unwrap()
        .execute()
        .await;

    assert!(report.outcome.is_ok());
    assert_eq!(h.cluster.submitted(), vec!["server.yaml", "client.yaml"]);
}

#[tokio::test(start_paused = true)]
async fn readiness_timeout_skips_client_but_tears_down() {
    let cluster = MockCluster::new().with_pod_field(POD_IP, vec![Reply::not_ready()]);
    let h = harness(cluster).await;

    let report = h
        .controller()
        .new_run(TestHarness::spec(pod2pod()))
        .await
        .unwrap()
        .execute()
        .await;

    assert!(matches!(
        report.outcome,
        Err(RunError::ReadinessTimeout { attempts: 10, .. })
    ));
    assert_eq!(h.cluster.pod_queries(POD_IP), 10);
    assert_eq!(h.cluster.submitted(), vec!["server.yaml"]);
    assert_eq!(h.cluster.pod_queries(POD_PHASE), 0);
    assert_eq!(h.cluster.log_fetches().len(), 2);
    assert_eq!(h.cluster.deletes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_client_is_reported_after_teardown() {
    let cluster = MockCluster::new()
        .with_pod_field(POD_IP, vec![Reply::line("10.0.0.7")])
        .with_pod_field(POD_PHASE, phases(&["Failed"]));
    let h = harness(cluster).await;

    let report = h
        .controller()
        .new_run(TestHarness::spec(pod2pod()))
        .await
        .unwrap()
        .execute()
        .await;

    assert!(matches!(report.outcome, Err(RunError::ClientExecutionFailed)));
    assert_eq!(h.cluster.pod_queries(POD_PHASE), 1);
    assert_eq!(h.cluster.log_fetches().len(), 2);
    assert_eq!(h.cluster.deletes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn phase_query_error_ends_the_run() {
    let cluster = MockCluster::new()
        .with_pod_field(POD_IP, vec![Reply::line("10.0.0.7")])
        .with_pod_field(POD_PHASE, vec![Reply::fail("pods \"cli\" not found")]);
    let h = harness(cluster).await;

    let report = h
        .controller()
        .new_run(TestHarness::spec(pod2pod()))
        .await
        .unwrap()
        .execute()
        .await;

    assert!(matches!(report.outcome, Err(RunError::PhaseQuery(_))));
    assert_eq!(h.cluster.log_fetches().len(), 2);
    assert_eq!(h.cluster.deletes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn server_submission_failure_stops_early() {
    let cluster = MockCluster::new().failing_submit("server.yaml");
    let h = harness(cluster).await;

    let report = h
        .controller()
        .new_run(TestHarness::spec(pod2pod()))
        .await
        .unwrap()
        .execute()
        .await;

    assert!(matches!(report.outcome, Err(RunError::Submission { what: "server", .. })));
    assert_eq!(h.cluster.pod_queries(POD_IP), 0);
    assert_eq!(h.cluster.log_fetches().len(), 2);
    assert_eq!(h.cluster.deletes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn cleanup_can_be_disabled() {
    let cluster = MockCluster::new()
        .with_pod_field(POD_IP, vec![Reply::line("10.0.0.7")])
        .with_pod_field(POD_PHASE, phases(&["Succeeded"]));
    let h = harness(cluster).await;
    let mut spec = TestHarness::spec(pod2pod());
    spec.cleanup = false;

    let report = h.controller().new_run(spec).await.unwrap().execute().await;

    assert!(report.outcome.is_ok());
    assert_eq!(h.cluster.log_fetches().len(), 2);
    assert!(h.cluster.deletes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn teardown_failures_do_not_replace_the_outcome() {
    let cluster = MockCluster::new()
        .with_pod_field(POD_IP, vec![Reply::line("10.0.0.7")])
        .with_pod_field(POD_PHASE, phases(&["Succeeded"]))
        .failing_logs()
        .failing_delete();
    let h = harness(cluster).await;

    let report = h
        .controller()
        .new_run(TestHarness::spec(pod2pod()))
        .await
        .unwrap()
        .execute()
        .await;

    assert!(report.outcome.is_ok());
    assert_eq!(report.teardown.len(), 3);
    assert_eq!(h.cluster.log_fetches().len(), 2);
    assert_eq!(h.cluster.deletes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn service_run_uses_the_cluster_ip() {
    let cluster = MockCluster::new()
        .with_service_field(SERVICE_IP, vec![Reply::not_ready(), Reply::line("10.96.0.10")])
        .with_pod_field(POD_PHASE, phases(&["Running", "Succeeded"]));
    let h = harness(cluster).await;
    let topology = Topology::Service {
        service_type: "NodePort".to_string(),
    };

    let report = h
        .controller()
        .new_run(TestHarness::spec(topology))
        .await
        .unwrap()
        .execute()
        .await;

    assert!(report.outcome.is_ok(), "{:?}", report.outcome);
    assert_eq!(h.cluster.service_queries(SERVICE_IP), 2);
    assert_eq!(h.cluster.pod_queries(POD_IP), 0);
    assert_eq!(h.cluster.submitted(), vec!["server.yaml", "client.yaml"]);

    let server = h.cluster.manifest("server.yaml").unwrap();
    assert!(server.contains("kind: Deployment"));
    assert!(server.contains("type: NodePort"));
    assert!(h.cluster.manifest("client.yaml").unwrap().contains("10.96.0.10"));
}

#[tokio::test(start_paused = true)]
async fn port_policy_is_applied_before_the_client() {
    let cluster = MockCluster::new()
        .with_pod_field(POD_IP, vec![Reply::line("10.0.0.7")])
        .with_pod_field(POD_PHASE, phases(&["Succeeded"]));
    let h = harness(cluster).await;

    let report = h
        .controller()
        .new_run(TestHarness::spec(Topology::PodToPod { port_policy: true }))
        .await
        .unwrap()
        .execute()
        .await;

    assert!(report.outcome.is_ok());
    assert_eq!(h.cluster.submitted(), vec!["server.yaml", "policy.yaml", "client.yaml"]);
    assert!(h.cluster.manifest("policy.yaml").unwrap().contains("kind: NetworkPolicy"));
}

#[tokio::test(start_paused = true)]
async fn rejected_policy_skips_the_client() {
    let cluster = MockCluster::new()
        .with_pod_field(POD_IP, vec![Reply::line("10.0.0.7")])
        .failing_submit("policy.yaml");
    let h = harness(cluster).await;

    let report = h
        .controller()
        .new_run(TestHarness::spec(Topology::PodToPod { port_policy: true }))
        .await
        .unwrap()
        .execute()
        .await;

    assert!(matches!(report.outcome, Err(RunError::Policy(_))));
    assert_eq!(h.cluster.submitted(), vec!["server.yaml", "policy.yaml"]);
    assert_eq!(h.cluster.deletes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancelled_run_still_tears_down() {
    let h = harness(MockCluster::new()).await;
    h.cancel.cancel();

    let report = h
        .controller()
        .new_run(TestHarness::spec(pod2pod()))
        .await
        .unwrap()
        .execute()
        .await;

    assert!(matches!(report.outcome, Err(RunError::Cancelled)));
    assert!(h.cluster.submitted().is_empty());
    assert_eq!(h.cluster.log_fetches().len(), 2);
    assert_eq!(h.cluster.deletes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn runs_with_the_same_label_get_distinct_ids() {
    let h = harness(MockCluster::new()).await;
    let controller = h.controller();

    let first = controller.new_run(TestHarness::spec(pod2pod())).await.unwrap();
    let second = controller.new_run(TestHarness::spec(pod2pod())).await.unwrap();

    assert_ne!(first.run_id(), second.run_id());
    assert!(first.dir().is_dir());
    assert!(second.dir().is_dir());
    assert_eq!(first.dir().parent(), Some(h.session_dir()));
}

#[tokio::test(start_paused = true)]
async fn overlong_label_is_rejected_before_anything_is_created() {
    let h = harness(MockCluster::new()).await;
    let mut spec = TestHarness::spec(pod2pod());
    spec.label = "a".repeat(RUN_LABEL_MAX + 1);

    let err = h.controller().new_run(spec).await.unwrap_err();

    assert!(matches!(err, RunError::Label(_)));
    assert_eq!(std::fs::read_dir(h.session_dir()).unwrap().count(), 1);
    assert!(h.cluster.calls().is_empty());
}
