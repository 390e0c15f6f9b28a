//! Source Classifier Model
//!
//! Validates operator-supplied source matchers (single IP, CIDR subnet,
//! inclusive range) and lowers each to a pure match predicate over the
//! IPv4 source address.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A typed source matcher as configured by the operator.
///
/// The serde tag ties each variant to its populated fields, so a spec whose
/// type disagrees with its fields is unrepresentable once decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceSpec {
    /// Exact match on a single IPv4 address.
    Ip { ip_address: String },
    /// CIDR subnet match, prefix length 0..=32.
    Subnet { subnet: String },
    /// Inclusive address range match, `range_start <= range_end`.
    Range {
        range_start: String,
        range_end: String,
    },
}

impl SourceSpec {
    /// The wire/storage tag of this variant.
    pub fn kind(&self) -> &'static str {
        match self {
            SourceSpec::Ip { .. } => "ip",
            SourceSpec::Subnet { .. } => "subnet",
            SourceSpec::Range { .. } => "range",
        }
    }

    /// Lower to a match predicate, validating every field.
    ///
    /// Lowering is deterministic and depends only on the spec fields.
    pub fn lower(&self) -> Result<SourcePredicate, Error> {
        match self {
            SourceSpec::Ip { ip_address } => Ok(SourcePredicate::Exact(parse_ipv4(ip_address)?)),
            SourceSpec::Subnet { subnet } => {
                let net: Ipv4Net = subnet
                    .parse()
                    .map_err(|_| Error::Validation(format!("invalid subnet: {}", subnet)))?;
                Ok(SourcePredicate::Masked {
                    network: net.network(),
                    prefix_len: net.prefix_len(),
                })
            }
            SourceSpec::Range {
                range_start,
                range_end,
            } => {
                let start = parse_ipv4(range_start)?;
                let end = parse_ipv4(range_end)?;
                if start > end {
                    return Err(Error::Validation(format!(
                        "invalid IP range: {} - {}",
                        range_start, range_end
                    )));
                }
                Ok(SourcePredicate::Range { start, end })
            }
        }
    }

    /// Validate without keeping the lowered form. Total: accepts exactly
    /// the inputs `lower` can lower.
    pub fn validate(&self) -> Result<(), Error> {
        self.lower().map(|_| ())
    }
}

fn parse_ipv4(s: &str) -> Result<Ipv4Addr, Error> {
    s.parse()
        .map_err(|_| Error::Validation(format!("invalid IPv4 address: {}", s)))
}

/// Lowered, pure predicate over the IPv4 source address field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourcePredicate {
    /// `src == addr`
    Exact(Ipv4Addr),
    /// `src & mask == network`, mask derived from the prefix length.
    Masked { network: Ipv4Addr, prefix_len: u8 },
    /// `start <= src <= end` under unsigned byte-lex order.
    Range { start: Ipv4Addr, end: Ipv4Addr },
}

impl SourcePredicate {
    /// Network mask for a prefix length (0..=32).
    pub fn mask(prefix_len: u8) -> Ipv4Addr {
        let bits = if prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix_len))
        };
        Ipv4Addr::from(bits)
    }

    /// Evaluate against a source address.
    pub fn matches(&self, src: Ipv4Addr) -> bool {
        match self {
            SourcePredicate::Exact(addr) => src == *addr,
            SourcePredicate::Masked {
                network,
                prefix_len,
            } => {
                let mask = u32::from(Self::mask(*prefix_len));
                u32::from(src) & mask == u32::from(*network)
            }
            SourcePredicate::Range { start, end } => *start <= src && src <= *end,
        }
    }
}
