#[path = "support/cluster.rs"]
mod cluster;

use cluster::{endpoint, wait_until, Cluster, ClusterOptions};
use metaprop::metadata::LOG_TABLE;
use metaprop::{
    ClientIdentity, ClusteringRange, Endpoint, KeyspaceDef, ReplicaTopology, Storage, TagKind,
    Verb, METADATA_KEYSPACE, VERSION_117,
};
use std::collections::BTreeSet;
use std::time::Duration;

const SETTLE: Duration = Duration::from_secs(5);

fn replicas_of(cluster: &Cluster, target: &str) -> BTreeSet<Endpoint> {
    let topology = cluster.network.topology();
    topology
        .natural_replicas(METADATA_KEYSPACE, topology.token(target.as_bytes()))
        .into_iter()
        .collect()
}

fn has_log_entry(storage: &dyn Storage, target: &str, kind: &TagKind) -> bool {
    storage
        .read(
            METADATA_KEYSPACE,
            LOG_TABLE,
            target.as_bytes(),
            &ClusteringRange::All,
        )
        .unwrap()
        .iter()
        .any(|cell| cell.name.component(2) == Some(kind.code()))
}

fn options(replication_factor: usize) -> ClusterOptions {
    ClusterOptions {
        replication_factor,
        ..ClusterOptions::default()
    }
}

#[test]
fn registry_entries_reach_every_live_member() {
    let cluster = Cluster::start_with(4, options(2));
    let target = "app.users";
    let replicas = replicas_of(&cluster, target);
    assert_eq!(replicas.len(), 2);
    let origin = cluster
        .nodes
        .iter()
        .position(|node| !replicas.contains(&node.endpoint))
        .unwrap();

    cluster
        .node(origin)
        .announcer()
        .announce_registry_update(target, &TagKind::TableDropped, "ops")
        .unwrap();
    for node in &cluster.nodes {
        let registry = node.node.registry().clone();
        assert!(
            wait_until(SETTLE, || registry
                .query(target, &TagKind::TableDropped)
                .unwrap()
                .as_deref()
                == Some("ops")),
            "registry entry missing on {}",
            node.endpoint
        );
    }

    cluster
        .node(origin)
        .announcer()
        .announce_registry_drop(target)
        .unwrap();
    for node in &cluster.nodes {
        let registry = node.node.registry().clone();
        assert!(wait_until(SETTLE, || !registry
            .is_enabled(target, &TagKind::TableDropped)
            .unwrap()));
    }
}

#[test]
fn audited_ddl_is_recorded_whichever_node_coordinates_it() {
    let cluster = Cluster::start_with(4, options(1));
    let target = "app";
    let replica = *replicas_of(&cluster, target).iter().next().unwrap();
    let replica_idx = cluster.index_of(replica);
    let coordinator = (0..cluster.nodes.len())
        .find(|idx| *idx != replica_idx)
        .unwrap();

    cluster
        .node(replica_idx)
        .announcer()
        .announce_registry_update(target, &TagKind::KeyspaceDropped, "ops")
        .unwrap();
    let registry = cluster.node(coordinator).registry().clone();
    assert!(wait_until(SETTLE, || registry
        .is_enabled(target, &TagKind::KeyspaceDropped)
        .unwrap()));

    let announcer = cluster.node(coordinator).announcer();
    announcer
        .announce_new_keyspace(&KeyspaceDef::simple(target, 1))
        .unwrap();
    assert!(cluster.converged(SETTLE));
    announcer.announce_keyspace_drop(target, None).unwrap();

    let storage = cluster.nodes[replica_idx].storage.clone();
    assert!(wait_until(SETTLE, || has_log_entry(
        &*storage,
        target,
        &TagKind::KeyspaceDropped
    )));
}

#[test]
fn unregistered_targets_produce_no_audit_traffic() {
    let cluster = Cluster::start(3);
    cluster.network.clear_sent();
    let sent = cluster
        .node(0)
        .announcer()
        .announce_metadata_log("app", &TagKind::KeyspaceDropped, None, "gone")
        .unwrap();
    assert!(!sent);
    assert!(cluster.network.sent_with(Verb::DefinitionsUpdate).is_empty());
    for node in &cluster.nodes {
        assert!(!has_log_entry(&*node.storage, "app", &TagKind::KeyspaceDropped));
    }
}

#[test]
fn audit_push_targets_natural_and_pending_replicas_only() {
    let cluster = Cluster::start_with(4, options(1));
    let target = "app.events";
    let natural = replicas_of(&cluster, target);
    assert_eq!(natural.len(), 1);
    let pending = cluster
        .nodes
        .iter()
        .map(|node| node.endpoint)
        .find(|endpoint| !natural.contains(endpoint))
        .unwrap();
    cluster.network.add_pending(pending);

    let announcer = cluster.node(0).announcer();
    announcer
        .announce_registry_update(target, &TagKind::RowUpdated, "ops")
        .unwrap();
    cluster.network.clear_sent();

    let client = ClientIdentity::new("bob");
    assert!(announcer
        .announce_metadata_log(target, &TagKind::RowUpdated, Some(&client), "x=1;")
        .unwrap());

    let expected: BTreeSet<Endpoint> = natural.iter().copied().chain([pending]).collect();
    let targets: BTreeSet<Endpoint> = cluster
        .network
        .sent_with(Verb::DefinitionsUpdate)
        .iter()
        .filter(|sent| sent.from == endpoint(1))
        .map(|sent| sent.to)
        .collect();
    assert_eq!(targets, expected);

    for node in &cluster.nodes {
        let storage = node.storage.clone();
        if expected.contains(&node.endpoint) {
            assert!(wait_until(SETTLE, || has_log_entry(
                &*storage,
                target,
                &TagKind::RowUpdated
            )));
        } else {
            assert!(!has_log_entry(&*storage, target, &TagKind::RowUpdated));
        }
    }

    let entry = cluster
        .nodes
        .iter()
        .find(|node| natural.contains(&node.endpoint))
        .unwrap()
        .storage
        .read(
            METADATA_KEYSPACE,
            LOG_TABLE,
            target.as_bytes(),
            &ClusteringRange::All,
        )
        .unwrap();
    assert!(entry
        .iter()
        .all(|cell| cell.name.component(1) == Some("bob")));
}

#[test]
fn audit_push_skips_replicas_on_an_older_protocol() {
    let cluster = Cluster::start_with(3, options(3));
    let target = "app";
    let announcer = cluster.node(0).announcer();
    announcer
        .announce_registry_update(target, &TagKind::KeyspaceAltered, "ops")
        .unwrap();
    cluster.network.set_protocol_version(endpoint(3), VERSION_117);
    cluster.network.clear_sent();

    assert!(announcer
        .announce_metadata_log(target, &TagKind::KeyspaceAltered, None, "v")
        .unwrap());
    let targets: BTreeSet<Endpoint> = cluster
        .network
        .sent_with(Verb::DefinitionsUpdate)
        .iter()
        .filter(|sent| sent.from == endpoint(1))
        .map(|sent| sent.to)
        .collect();
    assert_eq!(targets, BTreeSet::from([endpoint(1), endpoint(2)]));
}
