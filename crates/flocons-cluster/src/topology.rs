//! Topology client: publishes this node's address as an ephemeral znode
//! and watches sibling nodes under the same namespace, feeding every
//! add/remove into the dispatcher's backend set.

use crate::dispatcher::Dispatcher;
use dashmap::DashMap;
use flocons_core::Config;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;
use zookeeper::{Acl, CreateMode, WatchedEvent, WatchedEventType, ZkError, ZkState, ZooKeeper};

/// How long to wait between reconnect attempts after losing the
/// coordination session.
pub const RETRY_TIMEOUT: Duration = Duration::from_millis(5000);

/// How often the Watching state wakes to re-check `running` while no
/// session-loss event has fired. Purely a polling granularity for
/// external cancellation; session loss itself wakes the wait immediately.
const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// One-shot signal the session watcher fires on `Closed`/`AuthFailed`/
/// `Expired`, distinct from `running` (the externally-cancelled flag) so
/// a recoverable session loss never looks like a `close()` call.
struct SessionLost {
    lost: Mutex<bool>,
    condvar: Condvar,
}

impl SessionLost {
    fn new() -> Self {
        SessionLost {
            lost: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn mark(&self) {
        let mut lost = self.lost.lock().expect("session-lost mutex poisoned");
        *lost = true;
        self.condvar.notify_all();
    }

    /// Block in the Watching state until the session is lost or `running`
    /// is cleared by an external `close()`.
    fn wait_until_lost_or_stopped(&self, running: &AtomicBool) {
        let mut lost = self.lost.lock().expect("session-lost mutex poisoned");
        while !*lost && running.load(Ordering::SeqCst) {
            lost = self
                .condvar
                .wait_timeout(lost, WATCH_POLL_INTERVAL)
                .expect("session-lost condvar poisoned")
                .0;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub address: String,
    pub shard: String,
}

/// Live view of the cluster as seen from this node: every other node's
/// address/shard, kept in sync with the coordination service.
pub struct TopologyClient {
    current_node_name: String,
    current_shard: String,
    namespace: String,
    zk_path: String,
    servers: String,
    nodes: DashMap<String, NodeInfo>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    client: Mutex<Option<Arc<ZooKeeper>>>,
    running: Arc<AtomicBool>,
}

impl TopologyClient {
    /// Construct the client and spawn its background connection thread.
    /// `dispatcher`, when given, is kept in sync with the live node set -
    /// this is the dispatcher-integrated variant, and the dispatcher's
    /// backends are node *names* (not shards): `GetNodeForObject` resolves
    /// a path straight to the node that should own it.
    pub fn start(config: &Config, dispatcher: Option<Arc<dyn Dispatcher>>) -> Arc<Self> {
        let client = Arc::new(TopologyClient {
            current_node_name: config.node.name.clone(),
            current_shard: config.node.shard.clone(),
            namespace: config.namespace.clone(),
            zk_path: format!("/flocons/{}/{}", config.namespace, config.node.name),
            servers: config.zookeeper.join(","),
            nodes: DashMap::new(),
            dispatcher,
            client: Mutex::new(None),
            running: Arc::new(AtomicBool::new(true)),
        });

        let node_info = NodeInfo {
            name: config.node.name.clone(),
            address: config.node.external_address.clone(),
            shard: config.node.shard.clone(),
        };

        let background = Arc::clone(&client);
        thread::spawn(move || background.connect_loop(node_info));

        client
    }

    fn connect_loop(self: Arc<Self>, node_info: NodeInfo) {
        tracing::debug!(node = %self.current_node_name, "starting connection to coordination service");
        while self.running.load(Ordering::SeqCst) {
            match self.try_connect(&node_info) {
                Ok(()) => {}
                Err(e) => {
                    tracing::error!(error = %e, "could not connect to coordination service");
                }
            }
            {
                let mut client = self.client.lock().expect("zk client mutex poisoned");
                *client = None;
            }
            self.nodes.clear();
            self.sync_dispatcher();
            if !self.running.load(Ordering::SeqCst) {
                tracing::info!(node = %self.current_node_name, "topology client terminated");
                return;
            }
            tracing::info!(retry_ms = RETRY_TIMEOUT.as_millis() as u64, "will retry coordination connection");
            thread::sleep(RETRY_TIMEOUT);
        }
    }

    fn try_connect(self: &Arc<Self>, node_info: &NodeInfo) -> Result<(), ZkError> {
        let connected = Arc::new(AtomicBool::new(false));
        let connected_cb = Arc::clone(&connected);
        let session_lost = Arc::new(SessionLost::new());
        let session_lost_cb = Arc::clone(&session_lost);

        let zk = ZooKeeper::connect(&self.servers, Duration::from_secs(1), move |event: WatchedEvent| {
            if event.event_type == WatchedEventType::None {
                match event.keeper_state {
                    ZkState::SyncConnected => connected_cb.store(true, Ordering::SeqCst),
                    ZkState::Closed | ZkState::AuthFailed | ZkState::Expired => {
                        session_lost_cb.mark();
                    }
                    _ => {}
                }
            }
        })?;
        let zk = Arc::new(zk);
        tracing::info!(node = %self.current_node_name, "connected to coordination service");

        {
            let mut client = self.client.lock().expect("zk client mutex poisoned");
            *client = Some(Arc::clone(&zk));
        }

        self.ensure_parent_path(&zk)?;
        self.publish_node_info(&zk, node_info)?;
        self.watch_siblings(&zk)?;

        tracing::debug!(node = %self.current_node_name, "registered, now watching for topology changes");
        session_lost.wait_until_lost_or_stopped(&self.running);
        tracing::debug!(node = %self.current_node_name, "leaving watching state");

        Ok(())
    }

    fn ensure_parent_path(&self, zk: &ZooKeeper) -> Result<(), ZkError> {
        let parent = format!("/flocons/{}", self.namespace);
        for prefix in ["/flocons".to_string(), parent] {
            match zk.create(&prefix, vec![], Acl::open_unsafe().clone(), CreateMode::Persistent) {
                Ok(_) | Err(ZkError::NodeExists) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn publish_node_info(&self, zk: &ZooKeeper, node_info: &NodeInfo) -> Result<(), ZkError> {
        let payload = serde_json::to_vec(node_info).expect("NodeInfo always serializes");
        match zk.create(&self.zk_path, payload.clone(), Acl::open_unsafe().clone(), CreateMode::Ephemeral) {
            Ok(_) => Ok(()),
            Err(ZkError::NodeExists) => zk.set_data(&self.zk_path, payload, None).map(|_| ()),
            Err(e) => Err(e),
        }
    }

    /// Install the children watch on the namespace parent and do the
    /// initial node refresh. The watch re-arms itself on every fire, since
    /// ZooKeeper watches are one-shot by design.
    fn watch_siblings(self: &Arc<Self>, zk: &Arc<ZooKeeper>) -> Result<(), ZkError> {
        let parent = format!("/flocons/{}", self.namespace);
        self.arm_children_watch(zk, &parent)
    }

    fn arm_children_watch(self: &Arc<Self>, zk: &Arc<ZooKeeper>, parent: &str) -> Result<(), ZkError> {
        let this = Arc::clone(self);
        let zk_for_watch = Arc::clone(zk);
        let parent_owned = parent.to_string();

        let names = zk.get_children_w(parent, move |event: WatchedEvent| {
            if !this.running.load(Ordering::SeqCst) {
                return;
            }
            if event.event_type == WatchedEventType::NodeChildrenChanged {
                if let Ok(names) = zk_for_watch.get_children(&parent_owned, false) {
                    this.refresh_nodes(&zk_for_watch, &parent_owned, &names);
                }
                if let Err(e) = this.arm_children_watch(&zk_for_watch, &parent_owned) {
                    tracing::error!(error = %e, "failed to re-arm children watch");
                }
            }
        })?;
        self.refresh_nodes(zk, parent, &names);
        Ok(())
    }

    fn refresh_nodes(&self, zk: &ZooKeeper, parent: &str, names: &[String]) {
        let stale: Vec<String> = self
            .nodes
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| !names.contains(k))
            .collect();
        for name in stale {
            self.remove_node(&name);
        }

        for name in names {
            if name == &self.current_node_name || self.nodes.contains_key(name) {
                continue;
            }
            let path = format!("{parent}/{name}");
            if let Ok((data, _)) = zk.get_data(&path, false) {
                if let Ok(info) = serde_json::from_slice::<NodeInfo>(&data) {
                    tracing::info!(node = %self.current_node_name, peer = %name, shard = %info.shard, "discovered peer node");
                    self.nodes.insert(name.clone(), info);
                }
            }
        }
        self.sync_dispatcher();
    }

    fn remove_node(&self, name: &str) {
        if name == self.current_node_name {
            return;
        }
        tracing::info!(node = %self.current_node_name, peer = %name, "peer node disconnected");
        self.nodes.remove(name);
        self.sync_dispatcher();
    }

    /// Push the live backend set - every known peer plus the current node
    /// itself, keyed by node name - into the dispatcher.
    fn sync_dispatcher(&self) {
        if let Some(dispatcher) = &self.dispatcher {
            let backends: Vec<String> = self
                .nodes
                .iter()
                .map(|e| e.key().clone())
                .chain(std::iter::once(self.current_node_name.clone()))
                .collect();
            dispatcher.set(backends);
        }
    }

    /// The node the dispatcher selects for `path`, or `None` if there are
    /// no backends or the selection is this node itself.
    pub fn get_node_for_object(&self, path: &str) -> Option<NodeInfo> {
        let dispatcher = self.dispatcher.as_ref()?;
        let selected = dispatcher.get(path)?;
        if selected == self.current_node_name {
            return None;
        }
        self.nodes.get(&selected).map(|n| n.clone())
    }

    /// This node's own shard, as configured at startup.
    pub fn current_shard(&self) -> &str {
        &self.current_shard
    }

    /// Address of a live peer node by name, if known.
    pub fn peer_address(&self, name: &str) -> Option<String> {
        self.nodes.get(name).map(|n| n.address.clone())
    }

    /// Every node currently visible in this namespace (excluding self).
    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.nodes.iter().map(|e| e.value().clone()).collect()
    }

    /// Every peer sharing `shard`, excluding `exclude` by name.
    pub fn peers_in_shard<'a>(&self, shard: &str, exclude: &'a [String]) -> Vec<NodeInfo> {
        self.nodes
            .iter()
            .map(|e| e.value().clone())
            .filter(|n| n.shard == shard && !exclude.contains(&n.name))
            .collect()
    }

    pub fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        let client = self.client.lock().expect("zk client mutex poisoned");
        if let Some(zk) = client.as_ref() {
            let _ = zk.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zk_path_is_namespaced_by_node_name() {
        let config = Config {
            namespace: "flocons".into(),
            zookeeper: vec!["127.0.0.1:2181".into()],
            node: flocons_core::config::NodeSection {
                name: "node-a".into(),
                port: 62116,
                external_address: "http://node-a:62116".into(),
                shard: "shard-1".into(),
            },
            storage: Default::default(),
            sync: Default::default(),
        };
        let expected = format!("/flocons/{}/{}", config.namespace, config.node.name);
        assert_eq!(expected, "/flocons/flocons/node-a");
    }

    #[test]
    fn session_lost_wakes_a_waiting_thread_immediately() {
        let signal = Arc::new(SessionLost::new());
        let running = Arc::new(AtomicBool::new(true));

        let waiter_signal = Arc::clone(&signal);
        let waiter_running = Arc::clone(&running);
        let waiter = thread::spawn(move || {
            waiter_signal.wait_until_lost_or_stopped(&waiter_running);
        });

        thread::sleep(Duration::from_millis(50));
        signal.mark();

        // If `mark` didn't notify the condvar, this join would block for
        // the full `WATCH_POLL_INTERVAL` worth of retries instead of
        // returning right away.
        let start = std::time::Instant::now();
        waiter.join().unwrap();
        assert!(start.elapsed() < WATCH_POLL_INTERVAL);
    }

    #[test]
    fn session_lost_wait_also_exits_when_running_is_cleared() {
        let signal = Arc::new(SessionLost::new());
        let running = Arc::new(AtomicBool::new(true));

        let waiter_signal = Arc::clone(&signal);
        let waiter_running = Arc::clone(&running);
        let waiter = thread::spawn(move || {
            waiter_signal.wait_until_lost_or_stopped(&waiter_running);
        });

        thread::sleep(Duration::from_millis(50));
        running.store(false, Ordering::SeqCst);

        waiter.join().unwrap();
    }
}
