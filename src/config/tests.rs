use super::settings::Settings;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.node.host, "127.0.0.1");
    assert_eq!(settings.node.client_port, 5000);
    assert_eq!(settings.node.admin_port, 8080);
    assert_eq!(settings.cluster.max_cluster_size, 20);
    assert_eq!(settings.raft.election_timeout_min_ms, 150);
    assert_eq!(settings.raft.election_timeout_max_ms, 300);
    assert!(settings.raft.heartbeat_interval_ms < settings.raft.election_timeout_min_ms);
}

#[test]
fn test_derived_addresses() {
    let mut settings = Settings::default();
    settings.node.id = 3;
    settings.node.client_port = 5003;
    settings.node.data_dir = "/tmp/repsub".to_string();

    assert_eq!(settings.node_id_string(), "127.0.0.1:5003");
    assert_eq!(settings.rpc_port(), 6003);
    assert_eq!(settings.db_path(), "/tmp/repsub/messages_node_3.db");
    assert_eq!(settings.pid_path(), "/tmp/repsub/repsub_node_3.pid");
}
