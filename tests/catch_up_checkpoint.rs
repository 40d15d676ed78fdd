#[path = "support/cluster.rs"]
mod cluster;

use cluster::{endpoint, wait_until, Cluster, ClusterOptions};
use metaprop::{
    empty_version, KeyspaceDef, MetaConfig, PullDecision, Verb, CURRENT_VERSION, VERSION_11,
    VERSION_117,
};
use std::time::{Duration, Instant};
use uuid::Uuid;

const SETTLE: Duration = Duration::from_secs(5);

fn pulls_from(cluster: &Cluster, from: u8) -> usize {
    cluster
        .network
        .sent_with(Verb::MigrationRequest)
        .iter()
        .filter(|sent| sent.from == endpoint(from))
        .count()
}

#[test]
fn lagging_member_pulls_after_the_migration_delay() {
    let cluster = Cluster::start(3);
    let announcer = cluster.node(0).announcer();
    announcer
        .announce_new_keyspace(&KeyspaceDef::simple("seed", 1))
        .unwrap();
    assert!(cluster.converged(SETTLE));

    // Older members are left out of the broadcast and must catch up.
    cluster.network.set_protocol_version(endpoint(3), VERSION_117);
    let pulls_before = pulls_from(&cluster, 3);
    announcer
        .announce_new_keyspace(&KeyspaceDef::simple("app", 1))
        .unwrap();
    let delay = MetaConfig::default().migration_delay();
    assert!(wait_until(SETTLE, || cluster.scheduler.delays().contains(&delay)));
    assert!(cluster.node(2).schema().keyspace("app").is_none());
    assert_eq!(pulls_from(&cluster, 3), pulls_before);

    assert!(cluster.scheduler.fire(delay) >= 1);
    assert!(wait_until(SETTLE, || cluster
        .node(2)
        .schema()
        .keyspace("app")
        .is_some()));
    assert!(pulls_from(&cluster, 3) > pulls_before);
    assert!(cluster.converged(SETTLE));
}

#[test]
fn fresh_members_pull_immediately() {
    let cluster = Cluster::start_with(
        2,
        ClusterOptions {
            uptime: Duration::ZERO,
            ..ClusterOptions::default()
        },
    );
    cluster.network.set_protocol_version(endpoint(2), VERSION_117);
    cluster
        .node(0)
        .announcer()
        .announce_new_keyspace(&KeyspaceDef::simple("app", 1))
        .unwrap();
    assert!(cluster.converged(SETTLE));
    assert!(pulls_from(&cluster, 2) >= 1);
    assert!(!cluster
        .scheduler
        .delays()
        .contains(&MetaConfig::default().migration_delay()));
}

#[test]
fn pull_decisions_respect_version_and_eligibility() {
    let cluster = Cluster::start(3);
    let pulls = cluster.node(0).announcer().pulls();
    let ours = cluster.node(0).schema().version();
    assert_eq!(ours, empty_version());
    let later = Instant::now() + Duration::from_secs(3_600);

    assert_eq!(
        pulls.maybe_schedule_schema_pull_at(ours, endpoint(2), later),
        PullDecision::UpToDate
    );

    cluster.network.set_protocol_version(endpoint(2), VERSION_11);
    assert!(!pulls.should_pull_schema_from(&endpoint(2)));
    assert_eq!(
        pulls.maybe_schedule_schema_pull_at(Uuid::new_v4(), endpoint(2), later),
        PullDecision::Ineligible
    );

    cluster
        .network
        .add_node_with(endpoint(7), CURRENT_VERSION, true);
    assert!(!pulls.should_pull_schema_from(&endpoint(7)));
    cluster.network.set_protocol_version(endpoint(3), CURRENT_VERSION + 1);
    assert!(!pulls.should_pull_schema_from(&endpoint(3)));
    cluster.network.set_protocol_version(endpoint(3), VERSION_117);
    assert!(pulls.should_pull_schema_from(&endpoint(3)));
}

#[test]
fn delayed_pull_is_skipped_once_the_peer_is_gone() {
    let cluster = Cluster::start(2);
    cluster
        .node(0)
        .announcer()
        .announce_new_keyspace(&KeyspaceDef::simple("app", 1))
        .unwrap();
    assert!(cluster.converged(SETTLE));

    let pulls = cluster.node(0).announcer().pulls();
    let decision = pulls.maybe_schedule_schema_pull(Uuid::new_v4(), endpoint(2));
    let delay = MetaConfig::default().migration_delay();
    assert_eq!(decision, PullDecision::Delayed(delay));

    cluster.network.set_alive(endpoint(2), false);
    let before = pulls_from(&cluster, 1);
    cluster.scheduler.fire(delay);
    assert_eq!(pulls_from(&cluster, 1), before);
}

#[test]
fn reset_local_schema_pulls_everything_back() {
    let cluster = Cluster::start(2);
    cluster
        .node(0)
        .announcer()
        .announce_new_keyspace(&KeyspaceDef::simple("app", 2))
        .unwrap();
    assert!(cluster.converged(SETTLE));
    let expected = cluster.node(0).schema().version();

    let version = cluster
        .node(1)
        .announcer()
        .reset_local_schema(SETTLE)
        .unwrap();
    assert_eq!(version, Some(expected));
    assert!(cluster.node(1).schema().keyspace("app").is_some());
    assert_eq!(cluster.network.advertised_version(&endpoint(2)), Some(expected));
}

#[test]
fn reset_without_a_peer_leaves_an_empty_schema() {
    let cluster = Cluster::start(1);
    cluster
        .node(0)
        .announcer()
        .announce_new_keyspace(&KeyspaceDef::simple("app", 1))
        .unwrap();
    assert_eq!(
        cluster
            .node(0)
            .announcer()
            .reset_local_schema(SETTLE)
            .unwrap(),
        None
    );
    assert_eq!(cluster.node(0).schema().version(), empty_version());
    assert!(cluster.node(0).schema().keyspace("app").is_none());
}
