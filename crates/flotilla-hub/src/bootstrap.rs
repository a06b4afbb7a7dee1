//! Bootstrap hub entries
//!
//! A bootstrap hub is encoded as `transport://hub_id@ip[:port]`, e.g.
//! `tcp://4f1c…9a@192.0.2.1:17`.

use std::net::IpAddr;

use flotilla_core::{Error, Result};

use crate::identity::HubId;

/// A parsed bootstrap hub entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapEntry {
    /// Transport scheme, e.g. `tcp`
    pub transport: String,
    /// Hub identifier
    pub hub_id: HubId,
    /// Address to dial
    pub ip: IpAddr,
    /// Optional port; transports carry their own default
    pub port: Option<u16>,
}

impl BootstrapEntry {
    /// Parse a `transport://hub_id@ip[:port]` string.
    pub fn parse(entry: &str) -> Result<Self> {
        let (transport, rest) = entry
            .split_once("://")
            .ok_or_else(|| Error::MalformedData(format!("bootstrap entry missing scheme: {entry}")))?;
        if transport.is_empty() {
            return Err(Error::MalformedData(format!("bootstrap entry missing scheme: {entry}")));
        }

        let (id_part, addr_part) = rest
            .split_once('@')
            .ok_or_else(|| Error::MalformedData(format!("bootstrap entry missing hub id: {entry}")))?;
        let hub_id = HubId::from_hex(id_part)?;

        // IPv6 addresses are bracketed when a port follows.
        let (ip_str, port) = if let Some(bracketed) = addr_part.strip_prefix('[') {
            let (ip_str, rest) = bracketed.split_once(']').ok_or_else(|| {
                Error::MalformedData(format!("unterminated IPv6 address: {entry}"))
            })?;
            let port = match rest.strip_prefix(':') {
                Some(port) => Some(Self::parse_port(port)?),
                None => None,
            };
            (ip_str, port)
        } else if let Some((ip_str, port)) = addr_part.rsplit_once(':') {
            if ip_str.contains(':') {
                // Bare IPv6 without brackets, the colon belongs to the address.
                (addr_part, None)
            } else {
                (ip_str, Some(Self::parse_port(port)?))
            }
        } else {
            (addr_part, None)
        };

        let ip: IpAddr = ip_str
            .parse()
            .map_err(|_| Error::MalformedData(format!("invalid bootstrap IP: {ip_str}")))?;

        Ok(Self { transport: transport.to_string(), hub_id, ip, port })
    }

    /// Parse a whitespace-free list of entries, returning those that parse.
    pub fn parse_all(entries: &[String]) -> (Vec<Self>, Vec<Error>) {
        let mut parsed = Vec::new();
        let mut errors = Vec::new();
        for entry in entries {
            match Self::parse(entry) {
                Ok(entry) => parsed.push(entry),
                Err(err) => errors.push(err),
            }
        }
        (parsed, errors)
    }

    fn parse_port(port: &str) -> Result<u16> {
        port.parse()
            .map_err(|_| Error::MalformedData(format!("invalid bootstrap port: {port}")))
    }
}

impl std::fmt::Display for BootstrapEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}@", self.transport, self.hub_id.to_hex())?;
        match (self.ip, self.port) {
            (IpAddr::V6(ip), Some(port)) => write!(f, "[{ip}]:{port}"),
            (ip, Some(port)) => write!(f, "{ip}:{port}"),
            (ip, None) => write!(f, "{ip}"),
        }
    }
}
