//! Chord node: join, lookup, storage, and ring maintenance.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{SocketAddrV4, TcpListener};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use rand::Rng;
use tracing::{debug, info, trace};

use crate::common::{FingerTable, Id, ModRange, M};
use crate::rpc::config::Config;
use crate::rpc::messages::{ErrorSpecific, MessageType, RequestSpecific, ResponseSpecific};
use crate::rpc::server::serve;
use crate::rpc::{HandleRequest, RpcClient};
use crate::{Error, Result};

/// A member of a Chord ring.
///
/// Spawning binds the node's listener, joins (or starts) the ring, and runs
/// the periodic maintenance protocol in background threads. The handle is a
/// cheap [Clone]; only the handle returned by [ChordNode::spawn] owns the
/// background threads and can [ChordNode::shutdown] them.
#[derive(Debug)]
pub struct ChordNode {
    inner: Arc<Inner>,
    threads: Vec<JoinHandle<()>>,
}

impl Clone for ChordNode {
    fn clone(&self) -> Self {
        ChordNode {
            inner: self.inner.clone(),
            threads: Vec::new(),
        }
    }
}

impl ChordNode {
    /// Start the node identified by `name`.
    ///
    /// With no buddy the node becomes the sole member of a new ring,
    /// pointing every finger at itself. Otherwise it joins the ring through
    /// the buddy's address, seeding its finger table and updating the peers
    /// whose fingers should now point here.
    ///
    /// Fails with [Error::HashCollision] if `name` hashes onto an id whose
    /// derived address is already taken by a running node.
    pub fn spawn(name: &str, buddy: Option<SocketAddrV4>) -> Result<ChordNode> {
        Self::spawn_with_config(name, buddy, Config::default())
    }

    pub fn spawn_with_config(
        name: &str,
        buddy: Option<SocketAddrV4>,
        config: Config,
    ) -> Result<ChordNode> {
        let id = Id::hash(name);
        let address = config.resolver.resolve(id);

        let listener = TcpListener::bind(address).map_err(|error| match error.kind() {
            ErrorKind::AddrInUse => Error::HashCollision(id),
            _ => Error::IO(error),
        })?;
        listener.set_nonblocking(true)?;

        let (shutdown_tx, shutdown_rx) = flume::bounded::<()>(1);

        let inner = Arc::new(Inner {
            id,
            address,
            client: RpcClient::new(config.request_timeout),
            finger: Mutex::new(FingerTable::new(id)?),
            predecessor: Mutex::new(None),
            keys: Mutex::new(HashMap::new()),
            config,
            shutdown: Mutex::new(Some(shutdown_tx)),
        });

        let mut threads = Vec::new();

        let handler: Arc<dyn HandleRequest> = inner.clone();
        let receiver = shutdown_rx.clone();
        threads.push(thread::spawn(move || serve(listener, handler, receiver)));

        if let Some(buddy) = buddy {
            if let Err(error) = inner.join_network(buddy) {
                inner.signal_shutdown();
                return Err(error);
            }
        } else {
            inner.start_new_network();
        }

        info!(id = %inner.id, address = %inner.address, "Chord node listening");

        if inner.config.maintenance {
            threads.push(maintenance_loop(
                inner.clone(),
                shutdown_rx.clone(),
                inner.config.stabilize_interval,
                Inner::stabilize,
            ));
            threads.push(maintenance_loop(
                inner.clone(),
                shutdown_rx.clone(),
                inner.config.fix_fingers_interval,
                Inner::fix_fingers,
            ));
            threads.push(maintenance_loop(
                inner.clone(),
                shutdown_rx,
                inner.config.check_predecessor_interval,
                Inner::check_predecessor,
            ));
        }

        Ok(ChordNode { inner, threads })
    }

    // === Getters ===

    /// This node's ring id.
    pub fn id(&self) -> Id {
        self.inner.id
    }

    /// The address the node's RPC listener is bound to.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.inner.address
    }

    /// Snapshot of the node's identity and ring neighbors.
    pub fn info(&self) -> Info {
        Info {
            id: self.inner.id,
            local_addr: self.inner.address,
            successor: self.inner.successor(),
            predecessor: self.inner.predecessor(),
        }
    }

    // === Public Methods ===

    /// Store a key/value pair on the ring.
    ///
    /// Resolves the owning node of `hash(key)` and stores the pair there;
    /// the last write for a key wins. Returns false when the owner could not
    /// be resolved or reached.
    pub fn put(&self, key: &str, value: &str) -> bool {
        self.inner.put(key, value)
    }

    /// Retrieve the value stored for `key`, from whichever node owns it.
    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.get(key)
    }

    /// Resolve the node responsible for `id`: the first node clockwise whose
    /// id is greater than or equal to it.
    pub fn find_successor(&self, id: Id) -> Option<Id> {
        self.inner.find_successor(id)
    }

    /// Offer `candidate` as this node's predecessor; adopted only if it lies
    /// between the current predecessor and this node.
    pub fn notify(&self, candidate: Id) {
        self.inner.notify(candidate)
    }

    // === Maintenance ===
    //
    // Normally driven by the background threads; exposed so local harnesses
    // with maintenance disabled can converge a ring deterministically.

    /// Verify the successor and let it learn about this node.
    pub fn stabilize(&self) {
        self.inner.stabilize()
    }

    /// Refresh one random finger table entry.
    pub fn fix_fingers(&self) {
        self.inner.fix_fingers()
    }

    /// Refresh finger table entry `k` (1-indexed).
    pub fn fix_finger(&self, k: usize) {
        self.inner.fix_finger(k)
    }

    /// Drop the predecessor if it stopped answering pings.
    pub fn check_predecessor(&self) {
        self.inner.check_predecessor()
    }

    /// Stop the listener and the maintenance loops, and wait for them.
    ///
    /// In-flight RPC handlers are left to finish on their own threads. The
    /// key store is discarded with the process; nothing is persisted.
    pub fn shutdown(&mut self) {
        self.inner.signal_shutdown();

        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }

        debug!(id = %self.inner.id, "Chord node was shutdown");
    }

    /// True iff any finger table entry currently points at `id`.
    pub(crate) fn references(&self, id: Id) -> bool {
        self.inner.finger.lock().unwrap().references(id)
    }
}

/// Runs `task` every `interval` until the node shuts down. A failing
/// iteration only logs; the next tick retries.
fn maintenance_loop(
    inner: Arc<Inner>,
    shutdown: flume::Receiver<()>,
    interval: std::time::Duration,
    task: fn(&Inner),
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown.recv_timeout(interval) {
            Err(flume::RecvTimeoutError::Timeout) => task(&inner),
            _ => break,
        }
    })
}

/// Snapshot of a node's identity and ring neighbors.
#[derive(Debug, Clone, PartialEq)]
pub struct Info {
    id: Id,
    local_addr: SocketAddrV4,
    successor: Option<Id>,
    predecessor: Option<Id>,
}

impl Info {
    pub fn id(&self) -> Id {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    pub fn successor(&self) -> Option<Id> {
        self.successor
    }

    pub fn predecessor(&self) -> Option<Id> {
        self.predecessor
    }
}

#[derive(Debug)]
struct Inner {
    id: Id,
    address: SocketAddrV4,
    client: RpcClient,
    config: Config,
    finger: Mutex<FingerTable>,
    predecessor: Mutex<Option<Id>>,
    keys: Mutex<HashMap<String, String>>,
    shutdown: Mutex<Option<flume::Sender<()>>>,
}

impl Inner {
    // === Local state ===

    fn successor(&self) -> Option<Id> {
        self.finger.lock().unwrap().successor()
    }

    fn set_successor(&self, id: Id) {
        self.finger.lock().unwrap().set_node(1, id);
    }

    fn predecessor(&self) -> Option<Id> {
        *self.predecessor.lock().unwrap()
    }

    fn set_predecessor(&self, id: Option<Id>) {
        *self.predecessor.lock().unwrap() = id;
    }

    fn finger_start(&self, k: usize) -> Id {
        self.finger
            .lock()
            .unwrap()
            .get(k)
            .map(|entry| entry.start)
            .unwrap_or(self.id)
    }

    fn finger_node(&self, k: usize) -> Option<Id> {
        self.finger.lock().unwrap().get(k).and_then(|entry| entry.node)
    }

    /// Dropping the only sender disconnects every loop's receiver.
    fn signal_shutdown(&self) {
        self.shutdown.lock().unwrap().take();
    }

    // === RPC plumbing ===

    /// Dispatch a request to `target`, serving it locally when `target` is
    /// this node. Any failure degrades to None: the peer may be dead and
    /// the caller carries on with what it has.
    fn call(&self, target: Id, request: RequestSpecific) -> Option<ResponseSpecific> {
        if target == self.id {
            return match self.handle_request(request) {
                MessageType::Response(response) => Some(response),
                _ => None,
            };
        }

        let address = self.config.resolver.resolve(target);
        match self.client.call(address, request) {
            Ok(response) => Some(response),
            Err(error) => {
                debug!(id = %self.id, %target, ?error, "RPC call failed");
                None
            }
        }
    }

    fn successor_of(&self, target: Id) -> Option<Id> {
        match self.call(target, RequestSpecific::GetSuccessor)? {
            ResponseSpecific::NodeId { id } => Some(id),
            _ => None,
        }
    }

    fn predecessor_of(&self, target: Id) -> Option<Id> {
        match self.call(target, RequestSpecific::GetPredecessor)? {
            ResponseSpecific::Predecessor { id } => id,
            _ => None,
        }
    }

    fn closest_preceding_finger_of(&self, target: Id, id: Id) -> Option<Id> {
        match self.call(target, RequestSpecific::ClosestPrecedingFinger { id })? {
            ResponseSpecific::NodeId { id } => Some(id),
            _ => None,
        }
    }

    fn ping(&self, target: Id) -> bool {
        matches!(
            self.call(target, RequestSpecific::Ping),
            Some(ResponseSpecific::Pong)
        )
    }

    // === Lookup protocol ===

    /// The first node clockwise whose id is `>= id`.
    fn find_successor(&self, id: Id) -> Option<Id> {
        let successor = self.successor()?;

        if ModRange::ring(self.id.wrapping_add(1), successor.wrapping_add(1)).contains_id(id) {
            return Some(successor);
        }

        let n_prime = self.find_predecessor(id);
        if n_prime == self.id {
            return self.successor();
        }

        self.successor_of(n_prime)
    }

    /// Walk the ring toward the node that immediately precedes `id`.
    ///
    /// The walk is bounded to M hops so a cyclic or inconsistent finger
    /// table cannot loop forever; an unreachable hop or a jump that makes no
    /// progress terminates with the current best guess.
    fn find_predecessor(&self, id: Id) -> Id {
        let mut n_prime = self.id;

        for _ in 0..M {
            let successor = match self.successor_of(n_prime) {
                Some(successor) => successor,
                None => break,
            };

            if ModRange::ring(n_prime.wrapping_add(1), successor.wrapping_add(1)).contains_id(id) {
                break;
            }

            let n_next = match self.closest_preceding_finger_of(n_prime, id) {
                Some(n_next) => n_next,
                None => break,
            };
            if n_next == n_prime {
                break;
            }

            n_prime = n_next;
        }

        n_prime
    }

    /// The furthest finger strictly between this node and `id`, falling
    /// back to this node itself.
    fn closest_preceding_finger(&self, id: Id) -> Id {
        let finger = self.finger.lock().unwrap();

        for k in (1..=M).rev() {
            if let Some(node) = finger.get(k).and_then(|entry| entry.node) {
                if ModRange::ring(self.id.wrapping_add(1), id).contains_id(node) {
                    return node;
                }
            }
        }

        self.id
    }

    // === Join protocol ===

    fn start_new_network(&self) {
        self.finger.lock().unwrap().point_at_self(self.id);
        self.set_predecessor(Some(self.id));

        info!(id = %self.id, "Starting a new ring");
    }

    /// Join through `buddy`.
    ///
    /// Two nodes joining through the same buddy concurrently can leave a
    /// transiently inconsistent successor/predecessor pair; the periodic
    /// stabilize/notify rounds converge it afterwards.
    fn join_network(&self, buddy: SocketAddrV4) -> Result<()> {
        info!(id = %self.id, %buddy, "Joining the ring");

        self.init_finger_table(buddy)?;
        self.update_others();

        Ok(())
    }

    /// Seed the finger table through the buddy node.
    fn init_finger_table(&self, buddy: SocketAddrV4) -> Result<()> {
        let successor = self.find_successor_via(buddy, self.finger_start(1))?;
        self.set_successor(successor);

        // Splice into the ring: adopt the successor's predecessor and take
        // its place.
        let predecessor = self.predecessor_of(successor);
        self.set_predecessor(predecessor);
        let _ = self.call(successor, RequestSpecific::SetPredecessor { id: self.id });

        for k in 1..M {
            let start = self.finger_start(k + 1);
            let node = match self.finger_node(k) {
                // The previous finger already covers this start point.
                Some(previous) if ModRange::ring(self.id, previous).contains_id(start) => previous,
                _ => match self.find_successor_via(buddy, start) {
                    Ok(node) => node,
                    Err(error) => {
                        debug!(id = %self.id, k = k + 1, ?error, "Could not seed finger");
                        continue;
                    }
                },
            };

            self.finger.lock().unwrap().set_node(k + 1, node);
        }

        Ok(())
    }

    fn find_successor_via(&self, buddy: SocketAddrV4, id: Id) -> Result<Id> {
        match self.client.call(buddy, RequestSpecific::FindSuccessor { id })? {
            ResponseSpecific::NodeId { id } => Ok(id),
            other => {
                debug!(%buddy, ?other, "Unexpected response to find_successor");
                Err(Error::Remote(ErrorSpecific {
                    code: 203,
                    description: "unexpected response".to_string(),
                }))
            }
        }
    }

    /// Tell every node whose finger table should now include this node.
    fn update_others(&self) {
        for k in 1..=M {
            // The last node that might have this node as its k-th finger.
            let target = self.id.wrapping_sub(1 << (k - 1));
            let p = self.find_predecessor(target);

            let _ = self.call(
                p,
                RequestSpecific::UpdateFingerTable {
                    candidate: self.id,
                    index: k,
                },
            );
        }
    }

    /// Adopt `candidate` as finger `k` if it improves the entry, then
    /// propagate backwards around the ring. The propagation stops at the
    /// first node the candidate does not improve.
    fn update_finger_table(&self, candidate: Id, k: usize) -> bool {
        let adopted = {
            let mut finger = self.finger.lock().unwrap();

            let adopt = match finger.get(k) {
                None => false, // out-of-range index from the wire
                Some(entry) => match entry.node {
                    Some(current) => ModRange::ring(self.id, current).contains_id(candidate),
                    None => true,
                },
            };

            if adopt {
                finger.set_node(k, candidate);
            }
            adopt
        };

        if adopted {
            trace!(id = %self.id, %candidate, k, "Updated finger");

            if let Some(p) = self.predecessor() {
                if p != candidate {
                    let _ = self.call(
                        p,
                        RequestSpecific::UpdateFingerTable {
                            candidate,
                            index: k,
                        },
                    );
                }
            }
        }

        adopted
    }

    // === Maintenance protocol ===

    /// Verify the successor, adopt a closer one if its predecessor now lies
    /// between, and notify the (possibly updated) successor of this node.
    ///
    /// A successor that stops answering pings is replaced with the nearest
    /// live finger so the ring heals around dead nodes.
    fn stabilize(&self) {
        let mut successor = match self.successor() {
            Some(successor) => successor,
            None => return,
        };

        if successor != self.id && !self.ping(successor) {
            let replacement = self.next_live_node(successor);
            debug!(
                id = %self.id,
                dead = %successor,
                %replacement,
                "Successor unreachable, promoting replacement"
            );
            self.set_successor(replacement);
            successor = replacement;
        }

        // The open interval (self, successor) is empty when the successor is
        // the very next id; ModRange would read equal bounds as the full
        // ring and re-adopt forever.
        if successor != self.id.wrapping_add(1) {
            if let Some(x) = self.predecessor_of(successor) {
                if ModRange::ring(self.id.wrapping_add(1), successor).contains_id(x) && self.ping(x)
                {
                    trace!(id = %self.id, new_successor = %x, "Adopting closer successor");
                    self.set_successor(x);
                    successor = x;
                }
            }
        }

        let _ = self.call(successor, RequestSpecific::Notify { candidate: self.id });
    }

    /// The nearest live finger after `dead`, falling back to this node.
    fn next_live_node(&self, dead: Id) -> Id {
        let candidates = self.finger.lock().unwrap().nodes();

        for candidate in candidates {
            if candidate == dead {
                continue;
            }
            if candidate == self.id || self.ping(candidate) {
                return candidate;
            }
        }

        self.id
    }

    /// Adopt `candidate` as predecessor if this node has none, or if it lies
    /// between the current predecessor and this node. Repeated calls with
    /// the same candidate are no-ops after the first.
    fn notify(&self, candidate: Id) {
        let adopt = match self.predecessor() {
            None => true,
            Some(p) => ModRange::ring(p, self.id).contains_id(candidate),
        };

        if adopt {
            self.set_predecessor(Some(candidate));
        }
    }

    /// Refresh one random finger; amortizes a full table refresh across
    /// many cycles instead of recomputing all M entries at once.
    fn fix_fingers(&self) {
        let k = rand::thread_rng().gen_range(1..=M);
        self.fix_finger(k);
    }

    /// Recompute finger `k` from a fresh lookup of its start point.
    fn fix_finger(&self, k: usize) {
        let start = self.finger_start(k);

        if let Some(node) = self.find_successor(start) {
            self.finger.lock().unwrap().set_node(k, node);
        }
    }

    /// Clear the predecessor if it stopped answering pings; a later
    /// `notify` re-establishes it.
    fn check_predecessor(&self) {
        if let Some(p) = self.predecessor() {
            if !self.ping(p) {
                debug!(id = %self.id, predecessor = %p, "Predecessor unreachable, clearing");
                self.set_predecessor(None);
            }
        }
    }

    // === Storage ===

    fn put(&self, key: &str, value: &str) -> bool {
        let owner = match self.find_successor(Id::hash(key)) {
            Some(owner) => owner,
            None => return false,
        };

        matches!(
            self.call(
                owner,
                RequestSpecific::Put {
                    key: key.to_string(),
                    value: value.to_string(),
                },
            ),
            Some(ResponseSpecific::Stored { stored: true })
        )
    }

    fn get(&self, key: &str) -> Option<String> {
        let owner = self.find_successor(Id::hash(key))?;

        match self.call(
            owner,
            RequestSpecific::Get {
                key: key.to_string(),
            },
        )? {
            ResponseSpecific::Value { value } => value,
            _ => None,
        }
    }

    fn put_local(&self, key: String, value: String) -> bool {
        self.keys.lock().unwrap().insert(key, value);
        true
    }

    fn get_local(&self, key: &str) -> Option<String> {
        self.keys.lock().unwrap().get(key).cloned()
    }
}

impl HandleRequest for Inner {
    fn handle_request(&self, request: RequestSpecific) -> MessageType {
        let response = match request {
            RequestSpecific::FindSuccessor { id } => match self.find_successor(id) {
                Some(id) => ResponseSpecific::NodeId { id },
                None => {
                    return MessageType::Error(ErrorSpecific {
                        code: 201,
                        description: "lookup failed".to_string(),
                    })
                }
            },
            RequestSpecific::FindPredecessor { id } => ResponseSpecific::NodeId {
                id: self.find_predecessor(id),
            },
            RequestSpecific::ClosestPrecedingFinger { id } => ResponseSpecific::NodeId {
                id: self.closest_preceding_finger(id),
            },
            RequestSpecific::GetPredecessor => ResponseSpecific::Predecessor {
                id: self.predecessor(),
            },
            RequestSpecific::SetPredecessor { id } => {
                self.set_predecessor(Some(id));
                ResponseSpecific::Done
            }
            RequestSpecific::GetSuccessor => match self.successor() {
                Some(id) => ResponseSpecific::NodeId { id },
                None => {
                    return MessageType::Error(ErrorSpecific {
                        code: 201,
                        description: "successor unset".to_string(),
                    })
                }
            },
            RequestSpecific::SetSuccessor { id } => {
                self.set_successor(id);
                ResponseSpecific::Done
            }
            RequestSpecific::UpdateFingerTable { candidate, index } => ResponseSpecific::Updated {
                updated: self.update_finger_table(candidate, index),
            },
            RequestSpecific::Notify { candidate } => {
                self.notify(candidate);
                ResponseSpecific::Done
            }
            RequestSpecific::Ping => ResponseSpecific::Pong,
            RequestSpecific::Put { key, value } => ResponseSpecific::Stored {
                stored: self.put_local(key, value),
            },
            RequestSpecific::Get { key } => ResponseSpecific::Value {
                value: self.get_local(&key),
            },
        };

        MessageType::Response(response)
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use super::*;
    use crate::rpc::config::BasePortResolver;

    fn test_config(base_port: u16) -> Config {
        Config {
            resolver: Box::new(BasePortResolver::new(Ipv4Addr::LOCALHOST, base_port)),
            maintenance: false,
            ..Config::default()
        }
    }

    #[test]
    fn new_ring_points_everything_at_itself() {
        let mut node = ChordNode::spawn_with_config("alpha", None, test_config(45000)).unwrap();

        let info = node.info();
        assert_eq!(info.successor(), Some(node.id()));
        assert_eq!(info.predecessor(), Some(node.id()));

        // The sole member owns every id.
        assert_eq!(node.find_successor(Id::new(0)), Some(node.id()));
        assert_eq!(node.find_successor(node.id().wrapping_add(1)), Some(node.id()));

        node.shutdown();
    }

    #[test]
    fn put_get_roundtrip_on_a_single_node() {
        let mut node = ChordNode::spawn_with_config("storage", None, test_config(45200)).unwrap();

        assert!(node.put("russellwilson/2532975-1947", "qb stats row"));
        assert_eq!(
            node.get("russellwilson/2532975-1947"),
            Some("qb stats row".to_string())
        );

        // Last write wins.
        assert!(node.put("russellwilson/2532975-1947", "updated row"));
        assert_eq!(
            node.get("russellwilson/2532975-1947"),
            Some("updated row".to_string())
        );

        assert_eq!(node.get("never stored"), None);

        node.shutdown();
    }

    #[test]
    fn notify_is_idempotent() {
        let mut node = ChordNode::spawn_with_config("lonely", None, test_config(45400)).unwrap();

        let candidate = node.id().wrapping_sub(3);

        node.notify(candidate);
        assert_eq!(node.info().predecessor(), Some(candidate));

        node.notify(candidate);
        assert_eq!(node.info().predecessor(), Some(candidate));

        node.shutdown();
    }

    #[test]
    fn background_maintenance_stabilizes_a_two_node_ring() {
        let base_port = 45600;

        let config = Config {
            resolver: Box::new(BasePortResolver::new(Ipv4Addr::LOCALHOST, base_port)),
            maintenance: true,
            stabilize_interval: Duration::from_millis(50),
            fix_fingers_interval: Duration::from_millis(50),
            check_predecessor_interval: Duration::from_millis(50),
            ..Config::default()
        };
        let mut first = ChordNode::spawn_with_config("alpha", None, config).unwrap();

        let config = Config {
            resolver: Box::new(BasePortResolver::new(Ipv4Addr::LOCALHOST, base_port)),
            maintenance: true,
            stabilize_interval: Duration::from_millis(50),
            fix_fingers_interval: Duration::from_millis(50),
            check_predecessor_interval: Duration::from_millis(50),
            ..Config::default()
        };
        let mut second =
            ChordNode::spawn_with_config("beta", Some(first.local_addr()), config).unwrap();

        std::thread::sleep(Duration::from_millis(600));

        assert_eq!(first.info().successor(), Some(second.id()));
        assert_eq!(first.info().predecessor(), Some(second.id()));
        assert_eq!(second.info().successor(), Some(first.id()));
        assert_eq!(second.info().predecessor(), Some(first.id()));

        second.shutdown();
        first.shutdown();
    }
}
