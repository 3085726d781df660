use knb_controller::SessionError;
use knb_devkit::{AgentCall, MockAgents, MockCluster, TestHarness};

#[tokio::test]
async fn start_agents_submits_the_session_daemonset() {
    let h = TestHarness::new(MockCluster::new(), MockAgents::new()).await.unwrap();

    let path = h.controller().start_agents().await.unwrap();

    assert_eq!(path, h.session_dir().join("monitor.yaml"));
    assert_eq!(h.cluster.submitted(), vec!["monitor.yaml"]);
    let manifest = h.cluster.manifest("monitor.yaml").unwrap();
    assert!(manifest.contains("kind: DaemonSet"));
    assert!(manifest.contains("knb-sessid: \"test\""));
}

#[tokio::test]
async fn rejected_daemonset_is_an_error() {
    let cluster = MockCluster::new().failing_submit("monitor.yaml");
    let h = TestHarness::new(cluster, MockAgents::new()).await.unwrap();

    let err = h.controller().start_agents().await.unwrap_err();
    assert!(matches!(err, SessionError::StartAgents(_)));
}

#[tokio::test]
async fn stop_deletes_the_session_daemonset() {
    let h = TestHarness::new(MockCluster::new(), MockAgents::new()).await.unwrap();

    h.controller().stop().await.unwrap();

    assert_eq!(
        h.cluster.deletes(),
        vec![(vec!["daemonset".to_string()], "knb-sessid=test".to_string())]
    );
}

#[tokio::test]
async fn system_info_is_saved_per_node() {
    let cluster = MockCluster::new().with_nodes(&["k8s1", "k8s2"]);
    let h = TestHarness::new(cluster, MockAgents::new()).await.unwrap();

    let saved = h.controller().collect_system_info().await.unwrap();

    assert_eq!(
        saved,
        vec![h.session_dir().join("k8s1.sysinfo"), h.session_dir().join("k8s2.sysinfo")]
    );
    let info = std::fs::read_to_string(h.session_dir().join("k8s2.sysinfo")).unwrap();
    assert_eq!(info, "hostname: k8s2\n");
}

#[tokio::test(start_paused = true)]
async fn unreachable_node_fails_after_retries_without_blocking_others() {
    let cluster = MockCluster::new().with_nodes(&["k8s1", "k8s2"]);
    let h = TestHarness::new(cluster, MockAgents::new().unreachable("k8s2"))
        .await
        .unwrap();

    let err = h.controller().collect_system_info().await.unwrap_err();

    let SessionError::SystemInfo(failed) = err else {
        panic!("expected a system info error, got {err:?}");
    };
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0, "k8s2");
    assert!(h.session_dir().join("k8s1.sysinfo").exists());

    let attempts = h
        .agents
        .calls()
        .into_iter()
        .filter(|c| *c == AgentCall::Connect("k8s2".to_string()))
        .count();
    assert_eq!(attempts, h.config.monitor.sysinfo_retries as usize + 1);
}
