//! Static address assignment from the shared host-only pool.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use anyhow::{bail, Result};

use meridian_rs::machine::Machine;

pub const POOL_NETWORK: Ipv4Addr = Ipv4Addr::new(192, 168, 64, 0);
pub const POOL_PREFIX: u8 = 24;
pub const POOL_GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 64, 1);

fn parse_address(cidr: &str) -> Option<Ipv4Addr> {
    cidr.split('/').next()?.parse().ok()
}

/// Assign a free pool address to every network of `machine` whose address
/// is still empty. Addresses held by `others` (any entry with the same name
/// as `machine` is ignored) and the machine's own assigned networks are
/// never handed out twice.
pub fn allocate(machine: &mut Machine, others: &[Machine]) -> Result<()> {
    let mut used: HashSet<Ipv4Addr> = others
        .iter()
        .filter(|m| m.name != machine.name)
        .flat_map(|m| m.spec.networks.iter())
        .chain(machine.spec.networks.iter())
        .filter_map(|n| parse_address(&n.address))
        .collect();

    let base = u32::from(POOL_NETWORK);
    let broadcast = base | (u32::MAX >> POOL_PREFIX);
    let mut candidates = (base + 1..broadcast)
        .map(Ipv4Addr::from)
        .filter(|ip| *ip != POOL_GATEWAY);

    for network in machine
        .spec
        .networks
        .iter_mut()
        .filter(|n| n.address.is_empty())
    {
        let Some(ip) = candidates.find(|ip| !used.contains(ip)) else {
            bail!("no available ip address");
        };
        used.insert(ip);
        network.address = format!("{ip}/{POOL_PREFIX}");
        if network.ip_gateway.is_empty() {
            network.ip_gateway = POOL_GATEWAY.to_string();
        }
    }
    Ok(())
}
