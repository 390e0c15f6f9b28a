//! Rule Compiler
//!
//! Lowers the declarative model joined with live availability into an
//! ordered list of kernel rules. The input order (priority descending,
//! ties by ascending id) is preserved; the kernel evaluates top-down, so
//! earlier rules win.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::domain::entities::{ActiveRule, Address, Protocol};
use crate::domain::ports::{CompiledRule, RuleExpr};
use crate::error::Error;

/// Compiles routing rules into kernel rule sequences.
///
/// Backend selection is uniform random at compile time from the available
/// address pool, drawn from a per-process PRNG seeded at startup. The mutex
/// makes concurrent compilation safe; in practice the reconciler owns each
/// tick.
pub struct RuleCompiler {
    rng: Mutex<StdRng>,
}

impl RuleCompiler {
    /// Compiler with a PRNG seeded from the operating system.
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Compiler with a fixed seed, for deterministic selection in tests.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Compile `rules` against the available-address map.
    ///
    /// A rule with no available address is dropped with a warning so the
    /// packet filter falls through. A rule with invalid fields (unknown
    /// protocol, unlowerable source, malformed backend address) is skipped
    /// with an error log; the rest of the ruleset still compiles.
    pub fn compile(
        &self,
        rules: &[ActiveRule],
        addresses: &HashMap<i64, Vec<Address>>,
    ) -> Vec<CompiledRule> {
        let mut compiled = Vec::with_capacity(rules.len());

        for rule in rules {
            let pool = addresses
                .get(&rule.backend_set_id)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            if pool.is_empty() {
                tracing::warn!(
                    "no available backend addresses for rule {} (backend set {})",
                    rule.id,
                    rule.backend_set_id
                );
                continue;
            }

            match self.compile_rule(rule, pool) {
                Ok(r) => compiled.push(r),
                Err(e) => tracing::error!("skipping rule {}: {}", rule.id, e),
            }
        }

        compiled
    }

    fn compile_rule(&self, rule: &ActiveRule, pool: &[Address]) -> Result<CompiledRule, Error> {
        let protocol = Protocol::from_str(&rule.protocol)?;
        if rule.destination_port == 0 {
            return Err(Error::Validation(format!(
                "invalid destination port: {}",
                rule.destination_port
            )));
        }
        let predicate = rule.source.lower()?;

        let pick = self.rng.lock().gen_range(0..pool.len());
        let selected = &pool[pick];
        let addr: Ipv4Addr = selected.ip.parse().map_err(|_| {
            Error::Validation(format!("invalid backend IP address: {}", selected.ip))
        })?;

        let mut exprs = Vec::with_capacity(4);
        if let Some(proto) = protocol.proto_number() {
            exprs.push(RuleExpr::L4Proto(proto));
        }
        exprs.push(RuleExpr::DestPort(rule.destination_port));
        exprs.push(RuleExpr::Source(predicate));
        exprs.push(RuleExpr::Dnat {
            addr,
            port: selected.port,
        });

        Ok(CompiledRule {
            rule_id: rule.id,
            exprs,
            user_data: format!("rule_id:{}", rule.id),
        })
    }
}

impl Default for RuleCompiler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::source::{SourcePredicate, SourceSpec};
    use chrono::Utc;

    fn active_rule(id: i64, priority: i64, backend_set_id: i64) -> ActiveRule {
        ActiveRule {
            id,
            priority,
            destination_port: 80,
            protocol: "tcp".to_string(),
            backend_set_id,
            source: SourceSpec::Subnet {
                subnet: "10.1.0.0/16".to_string(),
            },
        }
    }

    fn address(id: i64, ip: &str, port: u16) -> Address {
        let now = Utc::now();
        Address {
            id,
            backend_id: 1,
            ip: ip.to_string(),
            port,
            available: true,
            last_checked: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn pool(addrs: &[(&str, u16)]) -> Vec<Address> {
        addrs
            .iter()
            .enumerate()
            .map(|(i, (ip, port))| address(i as i64 + 1, ip, *port))
            .collect()
    }

    #[test]
    fn test_compile_single_rule_expr_sequence() {
        let compiler = RuleCompiler::with_seed(1);
        let rules = vec![active_rule(3, 100, 1)];
        let mut addrs = HashMap::new();
        addrs.insert(1, pool(&[("10.0.0.10", 8080)]));

        let compiled = compiler.compile(&rules, &addrs);
        assert_eq!(compiled.len(), 1);

        let rule = &compiled[0];
        assert_eq!(rule.rule_id, 3);
        assert_eq!(rule.user_data, "rule_id:3");
        assert_eq!(rule.exprs.len(), 4);
        assert_eq!(rule.exprs[0], RuleExpr::L4Proto(6));
        assert_eq!(rule.exprs[1], RuleExpr::DestPort(80));
        assert_eq!(
            rule.exprs[2],
            RuleExpr::Source(SourcePredicate::Masked {
                network: "10.1.0.0".parse().unwrap(),
                prefix_len: 16,
            })
        );
        assert_eq!(
            rule.exprs[3],
            RuleExpr::Dnat {
                addr: "10.0.0.10".parse().unwrap(),
                port: 8080,
            }
        );
    }

    #[test]
    fn test_compile_udp_proto_number() {
        let compiler = RuleCompiler::with_seed(1);
        let mut rule = active_rule(1, 0, 1);
        rule.protocol = "udp".to_string();
        let mut addrs = HashMap::new();
        addrs.insert(1, pool(&[("10.0.0.10", 53)]));

        let compiled = compiler.compile(&[rule], &addrs);
        assert_eq!(compiled[0].l4proto(), Some(17));
    }

    #[test]
    fn test_compile_protocol_all_omits_l4_match() {
        let compiler = RuleCompiler::with_seed(1);
        let mut rule = active_rule(1, 0, 1);
        rule.protocol = "all".to_string();
        let mut addrs = HashMap::new();
        addrs.insert(1, pool(&[("10.0.0.10", 80)]));

        let compiled = compiler.compile(&[rule], &addrs);
        assert_eq!(compiled.len(), 1);
        assert_eq!(compiled[0].l4proto(), None);
        // destination-port compare still applies
        assert_eq!(compiled[0].dest_port(), Some(80));
        assert_eq!(compiled[0].exprs.len(), 3);
    }

    #[test]
    fn test_compile_empty_availability_emits_nothing() {
        let compiler = RuleCompiler::with_seed(1);
        let rules = vec![
            active_rule(1, 100, 1),
            active_rule(2, 50, 2),
            active_rule(3, 10, 3),
        ];
        let addrs = HashMap::new();

        let compiled = compiler.compile(&rules, &addrs);
        assert!(compiled.is_empty());
    }

    #[test]
    fn test_compile_rule_with_empty_pool_dropped_others_kept() {
        let compiler = RuleCompiler::with_seed(1);
        let rules = vec![active_rule(1, 200, 1), active_rule(2, 100, 2)];
        let mut addrs = HashMap::new();
        addrs.insert(1, pool(&[("10.0.0.10", 80)]));
        addrs.insert(2, Vec::new());

        let compiled = compiler.compile(&rules, &addrs);
        assert_eq!(compiled.len(), 1);
        assert_eq!(compiled[0].rule_id, 1);
    }

    #[test]
    fn test_compile_preserves_priority_order() {
        let compiler = RuleCompiler::with_seed(1);
        // input already priority-desc, id-asc
        let rules = vec![
            active_rule(5, 200, 1),
            active_rule(2, 100, 1),
            active_rule(4, 100, 1),
            active_rule(1, 0, 1),
        ];
        let mut addrs = HashMap::new();
        addrs.insert(1, pool(&[("10.0.0.10", 80)]));

        let compiled = compiler.compile(&rules, &addrs);
        let ids: Vec<i64> = compiled.iter().map(|r| r.rule_id).collect();
        assert_eq!(ids, vec![5, 2, 4, 1]);
    }

    #[test]
    fn test_compile_single_available_address_is_deterministic() {
        let rules = vec![active_rule(1, 0, 1)];
        let mut addrs = HashMap::new();
        addrs.insert(1, pool(&[("10.0.0.10", 80)]));

        for seed in [1, 7, 42, 1337] {
            let compiler = RuleCompiler::with_seed(seed);
            let compiled = compiler.compile(&rules, &addrs);
            assert_eq!(
                compiled[0].dnat_target(),
                Some(("10.0.0.10".parse().unwrap(), 80))
            );
        }
    }

    #[test]
    fn test_compile_selection_is_from_pool() {
        let compiler = RuleCompiler::new();
        let rules = vec![active_rule(1, 0, 1)];
        let mut addrs = HashMap::new();
        addrs.insert(1, pool(&[("10.0.0.10", 80), ("10.0.0.11", 80)]));

        for _ in 0..32 {
            let compiled = compiler.compile(&rules, &addrs);
            let (target, port) = compiled[0].dnat_target().unwrap();
            assert!(
                target == "10.0.0.10".parse::<std::net::Ipv4Addr>().unwrap()
                    || target == "10.0.0.11".parse::<std::net::Ipv4Addr>().unwrap()
            );
            assert_eq!(port, 80);
        }
    }

    #[test]
    fn test_compile_fixed_seed_is_reproducible() {
        let rules = vec![active_rule(1, 0, 1), active_rule(2, 0, 1)];
        let mut addrs = HashMap::new();
        addrs.insert(
            1,
            pool(&[("10.0.0.10", 80), ("10.0.0.11", 80), ("10.0.0.12", 80)]),
        );

        let first = RuleCompiler::with_seed(99).compile(&rules, &addrs);
        let second = RuleCompiler::with_seed(99).compile(&rules, &addrs);
        assert_eq!(first, second);
    }

    #[test]
    fn test_compile_skips_invalid_protocol() {
        let compiler = RuleCompiler::with_seed(1);
        let mut bad = active_rule(1, 200, 1);
        bad.protocol = "icmp".to_string();
        let rules = vec![bad, active_rule(2, 100, 1)];
        let mut addrs = HashMap::new();
        addrs.insert(1, pool(&[("10.0.0.10", 80)]));

        let compiled = compiler.compile(&rules, &addrs);
        assert_eq!(compiled.len(), 1);
        assert_eq!(compiled[0].rule_id, 2);
    }

    #[test]
    fn test_compile_skips_unlowerable_source() {
        let compiler = RuleCompiler::with_seed(1);
        let mut bad = active_rule(1, 200, 1);
        bad.source = SourceSpec::Range {
            range_start: "10.0.0.100".to_string(),
            range_end: "10.0.0.1".to_string(),
        };
        let rules = vec![bad, active_rule(2, 100, 1)];
        let mut addrs = HashMap::new();
        addrs.insert(1, pool(&[("10.0.0.10", 80)]));

        let compiled = compiler.compile(&rules, &addrs);
        assert_eq!(compiled.len(), 1);
        assert_eq!(compiled[0].rule_id, 2);
    }

    #[test]
    fn test_compile_skips_malformed_backend_address() {
        let compiler = RuleCompiler::with_seed(1);
        let rules = vec![active_rule(1, 0, 1)];
        let mut addrs = HashMap::new();
        addrs.insert(1, pool(&[("fe80::1", 80)]));

        let compiled = compiler.compile(&rules, &addrs);
        assert!(compiled.is_empty());
    }
}
