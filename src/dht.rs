//! Local multi-node test harness.

use std::net::Ipv4Addr;

use tracing::debug;

use crate::common::{Id, M};
use crate::node::ChordNode;
use crate::rpc::config::{BasePortResolver, Config};
use crate::{Error, Result};

/// An in-memory ring for local testing: the harness owns every node handle
/// instead of any process-wide registry.
///
/// Background maintenance is disabled on the members; call
/// [Testnet::run_maintenance] to converge the ring deterministically.
pub struct Testnet {
    pub nodes: Vec<ChordNode>,
    base_port: u16,
}

impl Testnet {
    /// Spawn `count` nodes listening on `base_port + id`, joined
    /// sequentially through the first. Generated names whose ids collide
    /// with an existing member are skipped, as are ids the harness already
    /// holds.
    pub fn new(count: usize, base_port: u16) -> Result<Testnet> {
        let mut testnet = Testnet {
            nodes: Vec::new(),
            base_port,
        };

        let mut index = 0;
        while testnet.nodes.len() < count {
            let name = format!("testnet-node-{}", index);
            index += 1;

            match testnet.join(&name) {
                Ok(()) => {}
                Err(Error::HashCollision(id)) => {
                    debug!(%id, name = name.as_str(), "Skipping colliding testnet node");
                }
                Err(error) => return Err(error),
            }
        }

        Ok(testnet)
    }

    /// Spawn one more node named `name` into the ring.
    ///
    /// Rejects a name hashing onto an id the ring already has with
    /// [Error::HashCollision]; the running members are untouched.
    pub fn join(&mut self, name: &str) -> Result<()> {
        let id = Id::hash(name);
        if self.nodes.iter().any(|node| node.id() == id) {
            return Err(Error::HashCollision(id));
        }

        let buddy = self.nodes.first().map(|node| node.local_addr());
        let node = ChordNode::spawn_with_config(name, buddy, self.config())?;
        self.nodes.push(node);

        Ok(())
    }

    /// Run `rounds` full maintenance rounds over every member: predecessor
    /// check, stabilize, and a full finger table refresh per node.
    pub fn run_maintenance(&self, rounds: usize) {
        for _ in 0..rounds {
            for node in &self.nodes {
                node.check_predecessor();
                node.stabilize();
                for k in 1..=M {
                    node.fix_finger(k);
                }
            }
        }
    }

    /// Shut down every member.
    pub fn shutdown(&mut self) {
        for node in self.nodes.iter_mut() {
            node.shutdown();
        }
    }

    fn config(&self) -> Config {
        Config {
            resolver: Box::new(BasePortResolver::new(Ipv4Addr::LOCALHOST, self.base_port)),
            maintenance: false,
            ..Config::default()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::NODES;

    /// The node that should own `key`: the first member id clockwise that is
    /// greater than or equal to it.
    fn expected_owner(sorted_ids: &[Id], key: Id) -> Id {
        sorted_ids
            .iter()
            .find(|id| id.as_u64() >= key.as_u64())
            .copied()
            .unwrap_or(sorted_ids[0])
    }

    #[test]
    fn lookups_agree_from_every_node() {
        let mut testnet = Testnet::new(5, 46000).unwrap();
        testnet.run_maintenance(5);

        let mut ids: Vec<Id> = testnet.nodes.iter().map(|node| node.id()).collect();
        ids.sort();

        for key in (0..NODES).step_by(7) {
            let key = Id::new(key);
            let expected = expected_owner(&ids, key);

            for node in &testnet.nodes {
                assert_eq!(
                    node.find_successor(key),
                    Some(expected),
                    "key {} resolved from node {}",
                    key,
                    node.id()
                );
            }
        }

        testnet.shutdown();
    }

    #[test]
    fn put_get_through_any_node() {
        let mut testnet = Testnet::new(4, 46200).unwrap();
        testnet.run_maintenance(5);

        assert!(testnet.nodes[0].put("apple", "fruit 1"));
        assert!(testnet.nodes[1].put("banana", "fruit 2"));
        assert!(testnet.nodes[2].put("cherry", "fruit 3"));

        for node in &testnet.nodes {
            assert_eq!(node.get("apple"), Some("fruit 1".to_string()));
            assert_eq!(node.get("banana"), Some("fruit 2".to_string()));
            assert_eq!(node.get("cherry"), Some("fruit 3".to_string()));
            assert_eq!(node.get("never stored"), None);
        }

        testnet.shutdown();
    }

    #[test]
    fn ring_heals_around_a_dead_node() {
        let mut testnet = Testnet::new(5, 46400).unwrap();
        testnet.run_maintenance(5);

        let keys = [
            "apple",
            "banana",
            "cherry",
            "durian",
            "elderberry",
            "fig",
            "grape",
        ];
        for (index, key) in keys.iter().copied().enumerate() {
            assert!(testnet.nodes[index % testnet.nodes.len()].put(key, key));
        }

        // Kill a mid-ring node: neither the first member nor its neighbors
        // get special treatment from the protocol.
        let mut sorted_ids: Vec<Id> = testnet.nodes.iter().map(|node| node.id()).collect();
        sorted_ids.sort();
        let victim_id = sorted_ids[sorted_ids.len() / 2];

        let position = testnet
            .nodes
            .iter()
            .position(|node| node.id() == victim_id)
            .unwrap();
        let mut victim = testnet.nodes.remove(position);
        victim.shutdown();

        testnet.run_maintenance(6);

        for node in &testnet.nodes {
            assert!(
                !node.references(victim_id),
                "node {} still routes through the dead node",
                node.id()
            );
            assert_ne!(node.info().predecessor(), Some(victim_id));
            assert_ne!(node.info().successor(), Some(victim_id));
        }

        // Keys owned by survivors stay retrievable from anywhere; keys the
        // victim owned are lost, there is no replication.
        for key in keys.iter().copied() {
            let owner = expected_owner(&sorted_ids, Id::hash(key));
            for node in &testnet.nodes {
                let found = node.get(key);
                if owner == victim_id {
                    assert_eq!(found, None, "key {} should have died with its owner", key);
                } else {
                    assert_eq!(found, Some(key.to_string()), "key {} from {}", key, node.id());
                }
            }
        }

        testnet.shutdown();
    }

    #[test]
    fn colliding_ids_are_rejected() {
        let mut testnet = Testnet {
            nodes: Vec::new(),
            base_port: 46600,
        };
        testnet.join("alpha").unwrap();

        // "probe-157" hashes onto the same 7-bit id as "alpha".
        assert!(matches!(
            testnet.join("probe-157"),
            Err(Error::HashCollision(id)) if id == Id::hash("alpha")
        ));

        assert_eq!(testnet.nodes.len(), 1);
        testnet.shutdown();
    }
}
