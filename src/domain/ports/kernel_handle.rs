//! Kernel Handle Port
//!
//! Abstracts the packet-filter control plane: one IPv4 NAT table owning one
//! prerouting-hooked chain, with atomic whole-chain replacement.

use std::net::Ipv4Addr;

use async_trait::async_trait;

use crate::domain::source::SourcePredicate;
use crate::error::Error;

/// Offset of the source address field in the IPv4 header.
pub const IPV4_SRC_OFFSET: u32 = 12;
/// Length of the IPv4 source address field.
pub const IPV4_SRC_LEN: u32 = 4;
/// Offset of the destination port in the TCP/UDP transport header.
pub const TRANSPORT_DPORT_OFFSET: u32 = 2;
/// Length of the destination port field.
pub const TRANSPORT_DPORT_LEN: u32 = 2;

/// One primitive match/transform expression of a compiled rule, in the
/// order the kernel classifier evaluates them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleExpr {
    /// Meta match on the L4 protocol number.
    L4Proto(u8),
    /// Big-endian compare against transport-header bytes
    /// [`TRANSPORT_DPORT_OFFSET`]..+[`TRANSPORT_DPORT_LEN`].
    DestPort(u16),
    /// Compare against network-header bytes
    /// [`IPV4_SRC_OFFSET`]..+[`IPV4_SRC_LEN`]: exact, masked, or ranged.
    Source(SourcePredicate),
    /// Load the selected address and big-endian port, then emit an
    /// IPv4-family destination-NAT action.
    Dnat { addr: Ipv4Addr, port: u16 },
}

/// A rule lowered to kernel primitives, tagged with its model row id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledRule {
    pub rule_id: i64,
    pub exprs: Vec<RuleExpr>,
    /// Opaque user tag correlating the kernel entry to its model row.
    pub user_data: String,
}

impl CompiledRule {
    /// The L4 protocol match, if one is emitted.
    pub fn l4proto(&self) -> Option<u8> {
        self.exprs.iter().find_map(|e| match e {
            RuleExpr::L4Proto(p) => Some(*p),
            _ => None,
        })
    }

    /// The destination-port match.
    pub fn dest_port(&self) -> Option<u16> {
        self.exprs.iter().find_map(|e| match e {
            RuleExpr::DestPort(p) => Some(*p),
            _ => None,
        })
    }

    /// The source predicate.
    pub fn source(&self) -> Option<&SourcePredicate> {
        self.exprs.iter().find_map(|e| match e {
            RuleExpr::Source(p) => Some(p),
            _ => None,
        })
    }

    /// The DNAT target.
    pub fn dnat_target(&self) -> Option<(Ipv4Addr, u16)> {
        self.exprs.iter().find_map(|e| match e {
            RuleExpr::Dnat { addr, port } => Some((*addr, *port)),
            _ => None,
        })
    }
}

/// Control-plane handle owning the declared table and chain.
#[async_trait]
pub trait KernelHandle: Send + Sync {
    /// Create the IPv4-family NAT table and its prerouting-hooked NAT
    /// chain at standard filter priority if missing. Idempotent; never
    /// flushes existing rules.
    async fn ensure(&self) -> Result<(), Error>;

    /// Atomically replace the chain's rule list with `rules`, in order.
    /// After success the chain contains exactly `rules`; on failure the
    /// previous ruleset remains in effect.
    async fn replace_rules(&self, rules: &[CompiledRule]) -> Result<(), Error>;

    /// Delete the chain and then the table, committed as one unit.
    async fn teardown(&self) -> Result<(), Error>;
}
