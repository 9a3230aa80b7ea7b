//! Subnet validation for `network` resources.

use crate::config::Config;
use crate::resource::{Resource, TYPE_NETWORK};
use crate::SchemaError;
use ipnetwork::IpNetwork;

/// An address bound to a host interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostNetwork {
    pub interface: String,
    pub network: IpNetwork,
}

/// Parse the `subnet` field of a network resource.
pub fn parse_subnet(resource: &Resource) -> Result<IpNetwork, SchemaError> {
    let raw = resource
        .field_str("subnet")
        .ok_or_else(|| SchemaError::InvalidSubnet {
            id: resource.id().clone(),
            subnet: String::new(),
            reason: "subnet is required".to_owned(),
        })?;
    raw.parse::<IpNetwork>()
        .map_err(|e| SchemaError::InvalidSubnet {
            id: resource.id().clone(),
            subnet: raw.to_owned(),
            reason: e.to_string(),
        })
}

fn overlaps(a: &IpNetwork, b: &IpNetwork) -> bool {
    match (a, b) {
        (IpNetwork::V4(x), IpNetwork::V4(y)) => x.contains(y.network()) || y.contains(x.network()),
        (IpNetwork::V6(x), IpNetwork::V6(y)) => x.contains(y.network()) || y.contains(x.network()),
        _ => false,
    }
}

/// Check that enabled networks in `config` neither overlap each other nor any
/// host interface. Every violation is reported.
pub fn validate_subnets(config: &Config, host: &[HostNetwork]) -> Result<(), SchemaError> {
    let mut errors = Vec::new();
    let mut seen: Vec<(&Resource, IpNetwork)> = Vec::new();

    for r in config.find_by_type(TYPE_NETWORK).filter(|r| !r.is_disabled()) {
        let subnet = match parse_subnet(r) {
            Ok(s) => s,
            Err(e) => {
                errors.push(e);
                continue;
            }
        };

        for (other, other_subnet) in &seen {
            if overlaps(&subnet, other_subnet) {
                errors.push(SchemaError::SubnetOverlap {
                    first: other.id().clone(),
                    second: r.id().clone(),
                });
            }
        }

        for h in host {
            if overlaps(&subnet, &h.network) {
                errors.push(SchemaError::HostSubnetOverlap {
                    id: r.id().clone(),
                    subnet: subnet.to_string(),
                    interface: h.interface.clone(),
                    address: h.network.to_string(),
                });
            }
        }

        seen.push((r, subnet));
    }

    match SchemaError::collect(errors) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
