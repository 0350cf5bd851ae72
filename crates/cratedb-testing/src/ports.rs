//! Free port discovery.
//!
//! Ports are probed, not reserved: another process may grab a port between
//! [`allocate`] returning it and the server binding it. Callers handle that
//! by treating a failed server start like any other start failure.

use crate::{Error, Result};
use rand::Rng;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};

/// Attempts made by [`allocate_in`] before giving up.
pub const MAX_RANGE_ATTEMPTS: usize = 16;

/// Returns true if a listener can currently be bound to `port` on `host`.
pub fn is_bindable(host: IpAddr, port: u16) -> bool {
    TcpListener::bind(SocketAddr::new(host, port)).is_ok()
}

/// Asks the OS for an ephemeral port on `host`, then releases it.
pub fn allocate_on(host: IpAddr) -> Result<u16> {
    let listener = TcpListener::bind(SocketAddr::new(host, 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Asks the OS for an ephemeral loopback port.
pub fn allocate() -> Result<u16> {
    allocate_on(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Picks a random bindable port in `low..=high`.
pub fn allocate_in(low: u16, high: u16) -> Result<u16> {
    if low > high {
        return Err(Error::Configuration(format!(
            "invalid port range {low}..={high}"
        )));
    }
    let host = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let mut rng = rand::thread_rng();
    for _ in 0..MAX_RANGE_ATTEMPTS {
        let candidate = rng.gen_range(low..=high);
        if is_bindable(host, candidate) {
            return Ok(candidate);
        }
    }
    Err(Error::NoFreePort {
        low,
        high,
        attempts: MAX_RANGE_ATTEMPTS,
    })
}

/// Allocates `count` mutually distinct ports on `host`.
pub fn allocate_distinct(host: IpAddr, count: usize) -> Result<Vec<u16>> {
    let mut seen = HashSet::with_capacity(count);
    let mut ports = Vec::with_capacity(count);
    // The OS rarely hands out the same ephemeral port twice in a row.
    let mut budget = count * 4 + MAX_RANGE_ATTEMPTS;
    while ports.len() < count {
        if budget == 0 {
            return Err(Error::NoFreePort {
                low: 0,
                high: u16::MAX,
                attempts: count * 4 + MAX_RANGE_ATTEMPTS,
            });
        }
        budget -= 1;
        let port = allocate_on(host)?;
        if seen.insert(port) {
            ports.push(port);
        }
    }
    Ok(ports)
}
