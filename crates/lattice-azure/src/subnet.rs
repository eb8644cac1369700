//! Subnet allocation for a cluster virtual network
//!
//! The parent network is split in half: the upper half goes to Calico pod
//! networking, and the master, worker and VPN gateway subnets are carved
//! from the lower half, in that order, each taking the first free block of
//! its configured size.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use lattice_common::Error;

/// Default prefix length of the master subnet
pub const DEFAULT_MASTER_PREFIX: u8 = 24;
/// Default prefix length of the worker and VPN subnets
pub const DEFAULT_WORKER_PREFIX: u8 = 24;

/// Sizes of the subnets carved from a cluster network
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubnetConfig {
    /// Prefix length of the master subnet
    pub master_prefix: u8,
    /// Prefix length of the worker subnet; the VPN subnet uses the same size
    pub worker_prefix: u8,
}

impl Default for SubnetConfig {
    fn default() -> Self {
        Self {
            master_prefix: DEFAULT_MASTER_PREFIX,
            worker_prefix: DEFAULT_WORKER_PREFIX,
        }
    }
}

impl SubnetConfig {
    /// Prefix lengths must name a valid IPv4 block
    pub fn validate(&self) -> Result<(), Error> {
        for (name, prefix) in [
            ("master", self.master_prefix),
            ("worker", self.worker_prefix),
        ] {
            if prefix > 32 {
                return Err(Error::validation(format!(
                    "{} subnet prefix /{} is not a valid IPv4 prefix",
                    name, prefix
                )));
            }
        }
        Ok(())
    }
}

/// Subnets allocated inside one cluster network
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subnets {
    /// The network everything was carved from
    pub parent: Ipv4Net,
    /// Upper half of the parent, reserved for pod networking
    pub calico: Ipv4Net,
    /// Control plane nodes
    pub master: Ipv4Net,
    /// Worker nodes
    pub worker: Ipv4Net,
    /// VPN gateway
    pub vpn: Ipv4Net,
}

impl Subnets {
    /// Split `parent` using the default subnet sizes
    pub fn compute(parent: Ipv4Net) -> Result<Self, Error> {
        compute(parent, &SubnetConfig::default())
    }
}

/// Parse a cluster network CIDR, normalizing host bits away
pub fn parse_network(cluster: &str, cidr: &str) -> Result<Ipv4Net, Error> {
    cidr.trim()
        .parse::<Ipv4Net>()
        .map(|net| net.trunc())
        .map_err(|e| {
            Error::validation_for_field(
                cluster,
                "spec.networkCidr",
                format!("invalid IPv4 CIDR {:?}: {}", cidr, e),
            )
        })
}

/// Split `parent` into Calico, master, worker and VPN subnets.
///
/// Deterministic: the same parent and config always produce the same
/// result. Fails with [`Error::SubnetSpaceExhausted`] when a block of the
/// requested size no longer fits.
pub fn compute(parent: Ipv4Net, config: &SubnetConfig) -> Result<Subnets, Error> {
    config.validate()?;
    let parent = parent.trunc();

    let calico = upper_half(parent)?;
    let master = first_free(parent, config.master_prefix, &[calico])?;
    let worker = first_free(parent, config.worker_prefix, &[calico, master])?;
    let vpn = first_free(parent, config.worker_prefix, &[calico, master, worker])?;

    Ok(Subnets {
        parent,
        calico,
        master,
        worker,
        vpn,
    })
}

fn upper_half(parent: Ipv4Net) -> Result<Ipv4Net, Error> {
    let half = parent.prefix_len() + 1;
    parent
        .subnets(half)
        .ok()
        .and_then(|mut halves| halves.nth(1))
        .ok_or_else(|| exhausted(parent, half))
}

fn first_free(parent: Ipv4Net, prefix_len: u8, taken: &[Ipv4Net]) -> Result<Ipv4Net, Error> {
    if prefix_len < parent.prefix_len() {
        return Err(Error::validation(format!(
            "a /{} subnet cannot fit inside {}",
            prefix_len, parent
        )));
    }
    let candidates = parent
        .subnets(prefix_len)
        .map_err(|_| exhausted(parent, prefix_len))?;

    candidates
        .into_iter()
        .find(|candidate| !taken.iter().any(|t| overlaps(candidate, t)))
        .ok_or_else(|| exhausted(parent, prefix_len))
}

fn overlaps(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    let a_net: Ipv4Addr = a.network();
    let b_net: Ipv4Addr = b.network();
    a.contains(&b_net) || b.contains(&a_net)
}

fn exhausted(parent: Ipv4Net, prefix_len: u8) -> Error {
    Error::SubnetSpaceExhausted {
        parent: parent.to_string(),
        prefix_len,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().expect("test CIDR should parse")
    }

    #[test]
    fn test_slash_16_is_split_in_order() {
        let subnets = Subnets::compute(net("10.0.0.0/16")).expect("a /16 has room");

        assert_eq!(subnets.calico, net("10.0.128.0/17"));
        assert_eq!(subnets.master, net("10.0.0.0/24"));
        assert_eq!(subnets.worker, net("10.0.1.0/24"));
        assert_eq!(subnets.vpn, net("10.0.2.0/24"));
    }

    #[test]
    fn test_computation_is_deterministic() {
        let parent = net("172.16.0.0/20");
        let first = Subnets::compute(parent).expect("a /20 has room");
        let second = Subnets::compute(parent).expect("a /20 has room");
        assert_eq!(first, second);
    }

    #[test]
    fn test_subnets_are_disjoint_and_inside_parent() {
        let subnets = compute(
            net("192.168.0.0/18"),
            &SubnetConfig {
                master_prefix: 26,
                worker_prefix: 22,
            },
        )
        .expect("a /18 has room");

        let all = [subnets.calico, subnets.master, subnets.worker, subnets.vpn];
        for (i, a) in all.iter().enumerate() {
            assert!(subnets.parent.contains(a), "{} escapes parent", a);
            for b in all.iter().skip(i + 1) {
                assert!(!overlaps(a, b), "{} overlaps {}", a, b);
            }
        }
        assert_eq!(subnets.master, net("192.168.0.0/26"));
        // the first /22 overlaps the master /26, so the worker moves up
        assert_eq!(subnets.worker, net("192.168.4.0/22"));
        assert_eq!(subnets.vpn, net("192.168.8.0/22"));
    }

    #[test]
    fn test_host_bits_are_ignored() {
        let subnets = Subnets::compute(net("10.0.7.9/16")).expect("a /16 has room");
        assert_eq!(subnets.parent, net("10.0.0.0/16"));
        assert_eq!(subnets.master, net("10.0.0.0/24"));
    }

    #[test]
    fn test_slash_24_parent_is_exhausted() {
        let err = Subnets::compute(net("10.0.0.0/24")).expect_err("no /24 fits beside calico");
        match err {
            Error::SubnetSpaceExhausted { parent, prefix_len } => {
                assert_eq!(parent, "10.0.0.0/24");
                assert_eq!(prefix_len, 24);
            }
            other => panic!("expected SubnetSpaceExhausted, got {:?}", other),
        }
    }

    #[test]
    fn test_worker_exhaustion_is_reported() {
        // a /23 holds calico (/24) and master (/24) but nothing else
        let err = Subnets::compute(net("10.0.0.0/23")).expect_err("no room for workers");
        assert!(matches!(
            err,
            Error::SubnetSpaceExhausted { prefix_len: 24, .. }
        ));
    }

    #[test]
    fn test_subnet_larger_than_parent_is_rejected() {
        let err = compute(
            net("10.0.0.0/26"),
            &SubnetConfig {
                master_prefix: 24,
                worker_prefix: 28,
            },
        )
        .expect_err("a /24 cannot come out of a /26");
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn test_host_route_cannot_be_halved() {
        let err = Subnets::compute(net("10.0.0.1/32")).expect_err("a /32 cannot be split");
        assert!(matches!(err, Error::SubnetSpaceExhausted { .. }));
    }

    #[test]
    fn test_parse_network_rejects_garbage() {
        let err = parse_network("prod", "10.0.0.0/40").expect_err("invalid prefix");
        match err {
            Error::Validation { cluster, field, .. } => {
                assert_eq!(cluster, "prod");
                assert_eq!(field.as_deref(), Some("spec.networkCidr"));
            }
            other => panic!("expected Validation, got {:?}", other),
        }
        assert!(parse_network("prod", "not-a-cidr").is_err());
    }
}
