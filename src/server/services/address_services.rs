use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;

/// what kind of network an address belongs to. anything that isn't `Public` never gets a
/// request from us unless an operator allowlisted it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressClass {
    Public,
    Private,
    Loopback,
    LinkLocal,
    UniqueLocal,
    Unspecified,
}

impl AddressClass {
    pub fn is_blocked(&self) -> bool {
        !matches!(self, Self::Public)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Public,
    Blocked,
}

pub fn classify(address: &IpAddr) -> AddressClass {
    match address {
        IpAddr::V4(v4) => classify_v4(v4),
        IpAddr::V6(v6) => classify_v6(v6),
    }
}

fn classify_v4(v4: &Ipv4Addr) -> AddressClass {
    let [a, b, ..] = v4.octets();

    match (a, b) {
        (127, _) => AddressClass::Loopback,
        // 0.0.0.0/8 "this network"
        (0, _) => AddressClass::Unspecified,
        (169, 254) => AddressClass::LinkLocal,
        (10, _) => AddressClass::Private,
        (172, 16..=31) => AddressClass::Private,
        (192, 168) => AddressClass::Private,
        _ => AddressClass::Public,
    }
}

fn classify_v6(v6: &Ipv6Addr) -> AddressClass {
    // ::ffff:a.b.c.d is the v4 address as far as the socket is concerned
    if let Some(v4) = v6.to_ipv4_mapped() {
        return classify_v4(&v4);
    }

    let first = v6.segments()[0];

    if v6.is_loopback() {
        AddressClass::Loopback
    } else if v6.is_unspecified() {
        // connecting to :: lands on the local host on most stacks
        AddressClass::Unspecified
    } else if first & 0xffc0 == 0xfe80 {
        AddressClass::LinkLocal
    } else if first & 0xfe00 == 0xfc00 {
        AddressClass::UniqueLocal
    } else {
        AddressClass::Public
    }
}

/// hostnames that are refused before we even look them up
pub fn is_blocked_hostname(hostname: &str) -> bool {
    let host = hostname.trim_end_matches('.').to_ascii_lowercase();
    host == "localhost" || host.ends_with(".local")
}

/// blocklist plus whatever the operator exempted with `SSRF_ALLOWLIST`
#[derive(Debug, Clone, Default)]
pub struct AddressPolicy {
    allowlist: Vec<IpNet>,
}

impl AddressPolicy {
    pub fn new(allowlist: Vec<IpNet>) -> Self {
        Self { allowlist }
    }

    pub fn verdict(&self, address: &IpAddr) -> Verdict {
        if !classify(address).is_blocked() || self.allowlist.iter().any(|net| net.contains(address))
        {
            Verdict::Public
        } else {
            Verdict::Blocked
        }
    }
}
