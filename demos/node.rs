//! Spawns a small local ring, stores a few records, and reads them back
//! through different members.

use std::net::Ipv4Addr;

use tracing::{info, Level};

use chord_ring::{BasePortResolver, ChordNode, Config, Result};

fn config() -> Config {
    Config {
        resolver: Box::new(BasePortResolver::new(Ipv4Addr::LOCALHOST, 43544)),
        ..Config::default()
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let mut first = ChordNode::spawn_with_config("alpha", None, config())?;
    let mut second = ChordNode::spawn_with_config("beta", Some(first.local_addr()), config())?;
    let mut third = ChordNode::spawn_with_config("gamma", Some(first.local_addr()), config())?;

    // Let a few stabilization rounds repair the freshly joined ring.
    std::thread::sleep(std::time::Duration::from_secs(3));

    for node in [&first, &second, &third] {
        info!(info = ?node.info(), "ring member");
    }

    let records = [
        ("russellwilson/2532975-1947", "qb stats row"),
        ("drewbrees/2504775-2001", "qb stats row"),
        ("tombrady/2504211-2000", "qb stats row"),
    ];

    for &(key, value) in records.iter() {
        let stored = first.put(key, value);
        info!(key, stored, "put");
    }

    for &(key, _) in records.iter() {
        let value = third.get(key);
        info!(key, ?value, "get");
    }

    third.shutdown();
    second.shutdown();
    first.shutdown();

    Ok(())
}
