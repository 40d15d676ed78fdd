#[path = "support/cluster.rs"]
mod cluster;

use cluster::{endpoint, wait_until, Cluster, ClusterOptions};
use metaprop::forwarder::forward_list;
use metaprop::metadata::LOG_TABLE;
use metaprop::timeouts::MUTATION_TIMEOUT;
use metaprop::wire;
use metaprop::{
    CellName, ClusteringRange, DroppableTask, MemoryStorage, MessageIn, MessageOut,
    MessagingService, MetaConfig, Mutation, MutationVerbHandler, SharedMetricsRegistry, Storage,
    TagKind, TaskOutcome, Transport, Verb, CURRENT_VERSION, FORWARD_FROM, FORWARD_TO,
    METADATA_KEYSPACE, VERSION_10,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const SETTLE: Duration = Duration::from_secs(5);

fn user_row(key: &str, email: &str) -> Mutation {
    let mut mutation = Mutation::new("app", key);
    let users = mutation.add_or_get("users");
    users.add_column(CellName::new([""]), Vec::new(), 10);
    users.add_column(CellName::new(["email"]), email, 10);
    mutation
}

fn email_of(storage: &dyn Storage, key: &str) -> Option<String> {
    storage
        .read("app", "users", key.as_bytes(), &ClusteringRange::All)
        .unwrap()
        .into_iter()
        .find(|cell| cell.name.component(0) == Some("email"))
        .map(|cell| cell.value_str())
}

fn acked(cluster: &Cluster, from: u8, to: u8, id: &str) -> bool {
    cluster
        .network
        .sent_with(Verb::RequestResponse)
        .iter()
        .any(|sent| sent.from == endpoint(from) && sent.to == endpoint(to) && sent.id == id)
}

#[test]
fn forwarded_write_acks_route_to_the_coordinator() {
    let cluster = Cluster::start(3);
    let coordinator = endpoint(9);
    cluster.network.add_node(coordinator);

    let payload = wire::encode_mutation(&user_row("k1", "a@b"), CURRENT_VERSION).unwrap();
    let forward = forward_list(&[(endpoint(3), "101".to_string())]).unwrap();
    let message =
        MessageOut::new(Verb::Mutation, payload).with_parameter(FORWARD_TO, forward);
    cluster
        .network
        .transport(coordinator)
        .send(&endpoint(2), "100", &message)
        .unwrap();

    assert!(wait_until(SETTLE, || acked(&cluster, 2, 9, "100")
        && acked(&cluster, 3, 9, "101")));
    assert!(!acked(&cluster, 3, 2, "101"), "relay must not receive the ack");
    for idx in [1, 2] {
        assert_eq!(
            email_of(&*cluster.nodes[idx].storage, "k1").as_deref(),
            Some("a@b")
        );
    }
    assert_eq!(email_of(&*cluster.nodes[0].storage, "k1"), None);

    let relayed: Vec<_> = cluster
        .network
        .sent_with(Verb::Mutation)
        .into_iter()
        .filter(|sent| sent.from == endpoint(2))
        .collect();
    assert_eq!(relayed.len(), 1);
    assert_eq!(relayed[0].to, endpoint(3));
    assert_eq!(relayed[0].id, "101");
    assert_eq!(
        relayed[0].message.parameter(FORWARD_FROM),
        Some(coordinator.octets().as_slice())
    );
}

#[test]
fn old_protocol_senders_are_not_forwarded() {
    let cluster = Cluster::start(3);
    let coordinator = endpoint(9);
    cluster.network.add_node(coordinator);
    cluster
        .network
        .set_protocol_version(coordinator, VERSION_10);

    let payload = wire::encode_mutation(&user_row("k2", "c@d"), VERSION_10).unwrap();
    let forward = forward_list(&[(endpoint(3), "201".to_string())]).unwrap();
    let message =
        MessageOut::new(Verb::Mutation, payload).with_parameter(FORWARD_TO, forward);
    cluster
        .network
        .transport(coordinator)
        .send(&endpoint(2), "200", &message)
        .unwrap();

    assert!(wait_until(SETTLE, || acked(&cluster, 2, 9, "200")));
    assert!(cluster
        .network
        .sent_with(Verb::Mutation)
        .iter()
        .all(|sent| sent.from != endpoint(2)));
    assert_eq!(email_of(&*cluster.nodes[2].storage, "k2"), None);
}

#[test]
fn failed_apply_sends_no_ack() {
    let network = metaprop::LocalNetwork::new(1);
    let local = endpoint(1);
    let coordinator = endpoint(9);
    network.add_node(local);
    network.add_node(coordinator);
    let storage = Arc::new(MemoryStorage::new());
    storage.fail_writes(true);
    let messaging = Arc::new(MessagingService::new(
        local,
        network.transport(local),
        SharedMetricsRegistry::new("test"),
    ));
    let handler = MutationVerbHandler::new(storage.clone(), messaging);
    let payload = wire::encode_mutation(&user_row("k3", "e@f"), CURRENT_VERSION).unwrap();
    let message = MessageIn::from_out(
        coordinator,
        &MessageOut::new(Verb::Mutation, payload),
        CURRENT_VERSION,
    );

    assert!(handler.do_verb(&message, "300").is_err());
    assert!(network.sent_with(Verb::RequestResponse).is_empty());

    storage.fail_writes(false);
    handler.do_verb(&message, "301").unwrap();
    let acks = network.sent_with(Verb::RequestResponse);
    assert_eq!(acks.len(), 1);
    assert_eq!((acks[0].to, acks[0].id.as_str()), (coordinator, "301"));
}

#[test]
fn stale_work_is_dropped_and_counted() {
    let cluster = Cluster::start(1);
    let node = cluster.node(0);
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let task = DroppableTask::constructed_at(
        Verb::Mutation,
        Instant::now() - MUTATION_TIMEOUT - Duration::from_millis(1),
        move || {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        },
    );

    let dropped = node.messaging().dropped();
    assert_eq!(task.run(MUTATION_TIMEOUT, dropped), TaskOutcome::Dropped);
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(dropped.count(Verb::Mutation), 1);
    assert_eq!(dropped.count(Verb::DefinitionsUpdate), 0);

    let snapshot = node.metrics_snapshot().unwrap();
    assert_eq!(
        snapshot.counters.get("metaprop.messaging.dropped.MUTATION"),
        Some(&1)
    );
    for stage in ["migration", "mutation", "request-response"] {
        let gauge = format!("metaprop.stage.{}.in_flight", stage);
        assert!(snapshot.gauges.contains_key(&gauge), "missing {}", gauge);
    }
}

#[test]
fn applied_rows_are_audited_when_enabled() {
    let mut config = MetaConfig::default();
    config.audit.row_mutations = true;
    let cluster = Cluster::start_with(
        3,
        ClusterOptions {
            config,
            ..ClusterOptions::default()
        },
    );
    cluster
        .node(0)
        .announcer()
        .announce_registry_update("app.users.k4", &TagKind::RowInserted, "ops")
        .unwrap();
    assert!(wait_until(SETTLE, || cluster
        .node(1)
        .registry()
        .is_enabled("app.users.k4", &TagKind::RowInserted)
        .unwrap()));

    let payload = wire::encode_mutation(&user_row("k4", "g@h"), CURRENT_VERSION).unwrap();
    cluster
        .network
        .transport(endpoint(1))
        .send(&endpoint(2), "400", &MessageOut::new(Verb::Mutation, payload))
        .unwrap();

    let storage = cluster.nodes[0].storage.clone();
    assert!(wait_until(SETTLE, || {
        storage
            .read(
                METADATA_KEYSPACE,
                LOG_TABLE,
                b"app.users.k4",
                &ClusteringRange::All,
            )
            .unwrap()
            .iter()
            .any(|cell| {
                cell.name.component(2) == Some("i_r")
                    && cell.name.component(3) == Some("value")
                    && cell.value_str() == "email=g@h;"
            })
    }));
}
