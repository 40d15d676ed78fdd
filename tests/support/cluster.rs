#![allow(dead_code)]

use metaprop::{
    Endpoint, LocalNetwork, MemoryStorage, MetaConfig, MetadataNode, Mutation, ScheduledTask,
    TaskScheduler, WritePath,
};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

static LOGGER: Once = Once::new();

pub fn init_logging() {
    LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub fn endpoint(last: u8) -> Endpoint {
    Endpoint::v4(10, 0, 0, last)
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Scheduler double that only runs tasks when told to.
#[derive(Default)]
pub struct ManualScheduler {
    tasks: Mutex<Vec<(Duration, ScheduledTask)>>,
}

impl ManualScheduler {
    pub fn pending(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .map(|(delay, _)| *delay)
            .collect()
    }

    /// Runs every task scheduled with exactly `delay`, leaving the rest.
    pub fn fire(&self, delay: Duration) -> usize {
        let due: Vec<ScheduledTask> = {
            let mut tasks = self.tasks.lock().unwrap();
            let (due, rest): (Vec<_>, Vec<_>) =
                tasks.drain(..).partition(|(scheduled, _)| *scheduled == delay);
            *tasks = rest;
            due.into_iter().map(|(_, task)| task).collect()
        };
        let fired = due.len();
        for task in due {
            task();
        }
        fired
    }
}

impl TaskScheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: ScheduledTask) {
        self.tasks.lock().unwrap().push((delay, task));
    }
}

/// Ordinary write path double that records what it was asked to write.
#[derive(Default)]
pub struct RecordingWritePath {
    pub batches: Mutex<Vec<Vec<Mutation>>>,
}

impl WritePath for RecordingWritePath {
    fn mutate(&self, mutations: Vec<Mutation>) -> Result<(), metaprop::MetaError> {
        self.batches.lock().unwrap().push(mutations);
        Ok(())
    }
}

pub struct TestNode {
    pub endpoint: Endpoint,
    pub storage: Arc<MemoryStorage>,
    pub node: MetadataNode,
}

pub struct Cluster {
    pub network: LocalNetwork,
    pub scheduler: Arc<ManualScheduler>,
    pub nodes: Vec<TestNode>,
}

pub struct ClusterOptions {
    pub replication_factor: usize,
    pub config: MetaConfig,
    /// How long ago every node started; past the migration delay means
    /// catch-up pulls are scheduled rather than immediate.
    pub uptime: Duration,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            config: MetaConfig::default(),
            uptime: Duration::from_secs(3_600),
        }
    }
}

impl Cluster {
    pub fn start(size: u8) -> Self {
        Self::start_with(size, ClusterOptions::default())
    }

    pub fn start_with(size: u8, options: ClusterOptions) -> Self {
        init_logging();
        let network = LocalNetwork::new(options.replication_factor);
        let scheduler = Arc::new(ManualScheduler::default());
        for last in 1..=size {
            network.add_node(endpoint(last));
        }
        let mut cluster = Self {
            network,
            scheduler,
            nodes: Vec::new(),
        };
        for last in 1..=size {
            cluster.attach_node(endpoint(last), &options);
        }
        cluster
    }

    /// Starts a metadata node on an endpoint already known to the network.
    pub fn attach_node(&mut self, endpoint: Endpoint, options: &ClusterOptions) -> usize {
        let storage = Arc::new(MemoryStorage::new());
        let started_at = Instant::now()
            .checked_sub(options.uptime)
            .unwrap_or_else(Instant::now);
        let node = MetadataNode::builder(options.config.clone())
            .storage(storage.clone())
            .membership(self.network.membership(endpoint))
            .topology(self.network.topology())
            .transport(self.network.transport(endpoint))
            .scheduler(self.scheduler.clone())
            .started_at(started_at)
            .start()
            .expect("node starts");
        self.network.attach(endpoint, node.sink());
        self.network.observe(endpoint, node.announcer().clone());
        self.nodes.push(TestNode {
            endpoint,
            storage,
            node,
        });
        self.nodes.len() - 1
    }

    pub fn node(&self, idx: usize) -> &MetadataNode {
        &self.nodes[idx].node
    }

    pub fn index_of(&self, endpoint: Endpoint) -> usize {
        self.nodes
            .iter()
            .position(|node| node.endpoint == endpoint)
            .expect("endpoint belongs to the cluster")
    }

    /// Waits until every node reports the same schema version as node 0.
    pub fn converged(&self, timeout: Duration) -> bool {
        wait_until(timeout, || {
            let expected = self.node(0).schema().version();
            self.nodes
                .iter()
                .all(|node| node.node.schema().version() == expected)
        })
    }

    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.node.shutdown();
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}
