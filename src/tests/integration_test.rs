use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::cluster::discovery::StaticDiscovery;
use crate::cluster::peer::Peer;
use crate::config::Settings;
use crate::node::NodeContext;
use crate::raft::state::Role;

struct ClusterSpec {
    client_ports: Vec<u16>,
    admin_ports: Vec<u16>,
}

impl ClusterSpec {
    fn new(client_base: u16, admin_base: u16, size: u16) -> Self {
        Self {
            client_ports: (0..size).map(|i| client_base + i).collect(),
            admin_ports: (0..size).map(|i| admin_base + i).collect(),
        }
    }
}

fn node_settings(dir: &TempDir, spec: &ClusterSpec, index: usize) -> Settings {
    let mut settings = Settings::default();
    settings.node.id = index as u32;
    settings.node.client_port = spec.client_ports[index];
    settings.node.admin_port = spec.admin_ports[index];
    settings.node.data_dir = dir
        .path()
        .join(format!("node{index}"))
        .to_string_lossy()
        .into_owned();
    settings.cluster.scan_interval_ms = 500;
    settings
}

fn discovery_for(spec: &ClusterSpec, index: usize) -> Arc<StaticDiscovery> {
    let peers = spec
        .client_ports
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != index)
        .map(|(i, port)| {
            let mut peer = Peer::new("127.0.0.1", *port);
            peer.admin_port = Some(spec.admin_ports[i]);
            peer
        })
        .collect();
    Arc::new(StaticDiscovery::new(peers))
}

async fn start_cluster(dir: &TempDir, spec: &ClusterSpec) -> Vec<Arc<NodeContext>> {
    let mut nodes = Vec::new();
    for index in 0..spec.client_ports.len() {
        let settings = node_settings(dir, spec, index);
        let node = NodeContext::start(settings, discovery_for(spec, index))
            .await
            .expect("node should start");
        nodes.push(node);
    }
    nodes
}

/// Polls until exactly one node is leader and every live node agrees on the
/// term. Returns the leader's index.
async fn await_single_leader(nodes: &[Arc<NodeContext>], deadline: Duration) -> usize {
    let end = tokio::time::Instant::now() + deadline;
    loop {
        let mut statuses = Vec::new();
        for node in nodes {
            statuses.push(node.raft.status().await);
        }
        let leaders: Vec<usize> = statuses
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == Role::Leader)
            .map(|(i, _)| i)
            .collect();
        if leaders.len() == 1 {
            let term = statuses[leaders[0]].current_term;
            if statuses.iter().all(|s| s.current_term == term) {
                return leaders[0];
            }
        }
        assert!(
            tokio::time::Instant::now() < end,
            "no stable single leader: {statuses:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn admin_get(port: u16, path: &str) -> serde_json::Value {
    reqwest::get(format!("http://127.0.0.1:{port}{path}"))
        .await
        .expect("admin endpoint reachable")
        .json()
        .await
        .expect("admin endpoint returns json")
}

async fn connect_subscriber(client_port: u16) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
    let stream = TcpStream::connect(("127.0.0.1", client_port))
        .await
        .expect("client port reachable");
    let (read_half, mut write_half) = stream.into_split();
    write_half.write_all(b"SUBSCRI").await.unwrap();
    write_half.flush().await.unwrap();
    (BufReader::new(read_half), write_half)
}

async fn next_line(reader: &mut BufReader<OwnedReadHalf>, deadline: Duration) -> Option<String> {
    let mut line = String::new();
    match tokio::time::timeout(deadline, reader.read_line(&mut line)).await {
        Ok(Ok(0)) | Err(_) => None,
        Ok(Ok(_)) => Some(line.trim_end().to_string()),
        Ok(Err(_)) => None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node_happy_path() {
    let dir = TempDir::new().unwrap();
    let spec = ClusterSpec::new(46110, 48110, 1);
    let nodes = start_cluster(&dir, &spec).await;
    await_single_leader(&nodes, Duration::from_secs(5)).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://127.0.0.1:{}/publish", spec.admin_ports[0]))
        .json(&serde_json::json!({
            "topic": "news",
            "format": "JSON",
            "body": "{\"Id\":1,\"EventName\":\"x\",\"Value\":\"hello\",\"Topic\":\"news\"}"
        }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    // The publish is committed; applying it to the store follows within the
    // apply loop's next pass.
    let end = tokio::time::Instant::now() + Duration::from_secs(3);
    let records = loop {
        let messages = admin_get(spec.admin_ports[0], "/messages").await;
        let records = messages["messages"].as_array().unwrap().clone();
        if !records.is_empty() {
            break records;
        }
        assert!(tokio::time::Instant::now() < end, "message never applied");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["topic"], "news");
    assert_eq!(records[0]["value"], "hello");

    let raft = admin_get(spec.admin_ports[0], "/raft").await;
    assert_eq!(raft["state"], "LEADER");
    assert!(raft["current_term"].as_u64().unwrap() >= 1);
    assert!(raft["log_length"].as_u64().unwrap() >= 2);

    let stats = admin_get(spec.admin_ports[0], "/stats").await;
    assert_eq!(stats["messages_stored"].as_u64(), Some(1));

    for node in &nodes {
        node.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tcp_publish_reaches_tcp_subscriber() {
    let dir = TempDir::new().unwrap();
    let spec = ClusterSpec::new(46150, 48150, 1);
    let nodes = start_cluster(&dir, &spec).await;
    await_single_leader(&nodes, Duration::from_secs(5)).await;

    let (mut sub_reader, mut sub_writer) = connect_subscriber(spec.client_ports[0]).await;
    sub_writer.write_all(b"SUBSCRIBE:news\n").await.unwrap();
    sub_writer.flush().await.unwrap();

    // PING works regardless of subscriptions.
    sub_writer.write_all(b"PING\n").await.unwrap();
    sub_writer.flush().await.unwrap();
    assert_eq!(
        next_line(&mut sub_reader, Duration::from_secs(2)).await,
        Some("PONG".to_string())
    );

    let publisher = TcpStream::connect(("127.0.0.1", spec.client_ports[0]))
        .await
        .unwrap();
    let (_pub_reader, mut pub_writer) = publisher.into_split();
    pub_writer.write_all(b"PUBLISH").await.unwrap();
    pub_writer
        .write_all(b"FORMAT:JSON|{\"Value\":\"m1\",\"Topic\":\"news\"}\n")
        .await
        .unwrap();
    pub_writer.flush().await.unwrap();

    let frame = next_line(&mut sub_reader, Duration::from_secs(3))
        .await
        .expect("subscriber should receive the publish");
    assert!(frame.starts_with("FORMAT:JSON|"), "unexpected frame: {frame}");
    assert!(frame.contains("\"Value\":\"m1\""));

    // A second subscriber on the same topic gets the history replayed.
    let (mut replay_reader, mut replay_writer) = connect_subscriber(spec.client_ports[0]).await;
    replay_writer.write_all(b"SUBSCRIBE:news\n").await.unwrap();
    replay_writer.flush().await.unwrap();
    let replayed = next_line(&mut replay_reader, Duration::from_secs(3))
        .await
        .expect("history should be replayed");
    assert!(replayed.contains("\"Value\":\"m1\""));

    for node in &nodes {
        node.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silent_subscriber_is_disconnected() {
    let dir = TempDir::new().unwrap();
    let spec = ClusterSpec::new(46160, 48160, 1);
    let mut settings = node_settings(&dir, &spec, 0);
    settings.broker.subscriber_idle_timeout_secs = 1;
    let node = NodeContext::start(settings, discovery_for(&spec, 0))
        .await
        .expect("node should start");
    let nodes = vec![node];
    await_single_leader(&nodes, Duration::from_secs(5)).await;

    let (mut sub_reader, mut sub_writer) = connect_subscriber(spec.client_ports[0]).await;
    sub_writer.write_all(b"SUBSCRIBE:x\n").await.unwrap();
    sub_writer.flush().await.unwrap();

    let end = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let subs = admin_get(spec.admin_ports[0], "/subscribers").await;
        if !subs["subscribers"].as_array().unwrap().is_empty() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < end,
            "subscriber never registered"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // No PING: the broker closes the connection after the idle window and
    // forgets the subscriber.
    assert_eq!(
        next_line(&mut sub_reader, Duration::from_secs(5)).await,
        None,
        "connection should be closed by the broker"
    );
    let end = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let subs = admin_get(spec.admin_ports[0], "/subscribers").await;
        if subs["subscribers"].as_array().unwrap().is_empty() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < end,
            "subscriber never forgotten: {subs}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    nodes[0].stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_cluster_replicates_publishes() {
    let dir = TempDir::new().unwrap();
    let spec = ClusterSpec::new(46120, 48120, 3);
    let nodes = start_cluster(&dir, &spec).await;

    let leader = await_single_leader(&nodes, Duration::from_secs(8)).await;
    let follower = (leader + 1) % 3;

    // Subscriber on a follower.
    let (mut sub_reader, mut sub_writer) = connect_subscriber(spec.client_ports[follower]).await;
    sub_writer.write_all(b"SUBSCRIBE:news\n").await.unwrap();
    sub_writer.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Publish at the leader.
    let client = reqwest::Client::new();
    let response = client
        .post(format!(
            "http://127.0.0.1:{}/publish",
            spec.admin_ports[leader]
        ))
        .json(&serde_json::json!({
            "topic": "news",
            "format": "JSON",
            "body": "{\"Value\":\"M\",\"Topic\":\"news\"}"
        }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    // The follower-attached subscriber receives the frame.
    let frame = next_line(&mut sub_reader, Duration::from_secs(5))
        .await
        .expect("follower subscriber should receive the publish");
    assert!(frame.contains("\"Value\":\"M\""), "unexpected frame: {frame}");

    // Every node eventually stores the message.
    for (i, _) in nodes.iter().enumerate() {
        let end = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let messages = admin_get(spec.admin_ports[i], "/messages").await;
            let found = messages["messages"]
                .as_array()
                .unwrap()
                .iter()
                .any(|m| m["value"] == "M");
            if found {
                break;
            }
            assert!(
                tokio::time::Instant::now() < end,
                "node {i} never stored the message"
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    // Writes at a follower are redirected, not accepted.
    let no_redirect = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();
    let response = no_redirect
        .post(format!(
            "http://127.0.0.1:{}/publish",
            spec.admin_ports[follower]
        ))
        .json(&serde_json::json!({
            "topic": "news",
            "format": "RAW",
            "body": "should not be accepted here"
        }))
        .send()
        .await
        .unwrap();
    match response.status().as_u16() {
        307 => {
            let location = response
                .headers()
                .get("location")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            assert!(
                location.contains(&spec.admin_ports[leader].to_string()),
                "redirect should point at the leader: {location}"
            );
        }
        503 => {
            let body: serde_json::Value = response.json().await.unwrap();
            assert!(body["leader"].is_string(), "error should carry the leader");
        }
        other => panic!("expected 307 or 503 from a follower, got {other}"),
    }

    for node in &nodes {
        node.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_failure_triggers_reelection() {
    let dir = TempDir::new().unwrap();
    let spec = ClusterSpec::new(46130, 48130, 3);
    let nodes = start_cluster(&dir, &spec).await;

    let old_leader = await_single_leader(&nodes, Duration::from_secs(8)).await;
    let old_term = nodes[old_leader].raft.status().await.current_term;

    nodes[old_leader].stop().await;

    let survivors: Vec<Arc<NodeContext>> = nodes
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != old_leader)
        .map(|(_, n)| n.clone())
        .collect();

    let new_leader = await_single_leader(&survivors, Duration::from_secs(8)).await;
    let new_term = survivors[new_leader].raft.status().await.current_term;
    assert!(
        new_term > old_term,
        "new leader's term {new_term} must exceed {old_term}"
    );

    for node in survivors {
        node.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_recovers_state_and_rejoins() {
    let dir = TempDir::new().unwrap();
    let spec = ClusterSpec::new(46140, 48140, 1);

    {
        let nodes = start_cluster(&dir, &spec).await;
        await_single_leader(&nodes, Duration::from_secs(5)).await;

        let client = reqwest::Client::new();
        for value in ["one", "two"] {
            let response = client
                .post(format!("http://127.0.0.1:{}/publish", spec.admin_ports[0]))
                .json(&serde_json::json!({
                    "topic": "news",
                    "format": "RAW",
                    "body": format!("[news] {value}")
                }))
                .send()
                .await
                .unwrap();
            assert!(response.status().is_success());
        }
        nodes[0].stop().await;
    }

    // The old node still holds the sled lock until its tasks wind down.
    let settings = node_settings(&dir, &spec, 0);
    let mut restarted = None;
    let end = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < end {
        match NodeContext::start(settings.clone(), discovery_for(&spec, 0)).await {
            Ok(node) => {
                restarted = Some(node);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(200)).await,
        }
    }
    let node = restarted.expect("node should restart from its on-disk state");

    let nodes = vec![node];
    await_single_leader(&nodes, Duration::from_secs(5)).await;

    // The restored log replays through the apply loop shortly after the
    // node re-elects itself.
    let end = tokio::time::Instant::now() + Duration::from_secs(5);
    let values = loop {
        let messages = admin_get(spec.admin_ports[0], "/messages").await;
        let values: Vec<String> = messages["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["value"].as_str().unwrap_or_default().to_string())
            .collect();
        if values.len() >= 2 {
            break values;
        }
        assert!(
            tokio::time::Instant::now() < end,
            "stored messages never recovered: {values:?}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    };
    assert_eq!(values, vec!["one".to_string(), "two".to_string()]);

    let end = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let raft = admin_get(spec.admin_ports[0], "/raft").await;
        if raft["log_length"].as_u64().unwrap() >= 3 && raft["last_applied"].as_u64().unwrap() >= 3
        {
            break;
        }
        assert!(
            tokio::time::Instant::now() < end,
            "applied watermark never restored: {raft}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    nodes[0].stop().await;
}
