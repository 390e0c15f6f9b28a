//! nftables Kernel Handle
//!
//! Drives the host packet filter through nft(8). Every operation renders
//! one ruleset script and commits it with a single `nft -f -` invocation;
//! nftables applies a script as one transaction, so the chain is never
//! observable in a half-rewritten state and a failed commit leaves the
//! previous ruleset in effect.

use std::process::Stdio;

use async_trait::async_trait;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::domain::ports::{CompiledRule, KernelHandle, RuleExpr};
use crate::domain::source::SourcePredicate;
use crate::error::Error;

/// Kernel handle owning one IPv4 NAT table and its prerouting chain.
pub struct NftKernelHandle {
    table: String,
    chain: String,
}

impl NftKernelHandle {
    pub fn new(table: impl Into<String>, chain: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            chain: chain.into(),
        }
    }

    /// Declarative table/chain include: creates what is missing and leaves
    /// existing rules alone, which makes `ensure` idempotent.
    fn ensure_script(&self) -> String {
        format!(
            "table ip {table} {{\n\tchain {chain} {{\n\t\ttype nat hook prerouting priority filter;\n\t}}\n}}\n",
            table = self.table,
            chain = self.chain,
        )
    }

    /// Flush plus ordered re-adds, committed as one transaction.
    fn replace_script(&self, rules: &[CompiledRule]) -> String {
        let mut script = format!("flush chain ip {} {}\n", self.table, self.chain);
        for rule in rules {
            script.push_str("add rule ip ");
            script.push_str(&self.table);
            script.push(' ');
            script.push_str(&self.chain);
            script.push(' ');
            script.push_str(&render_rule(rule));
            script.push('\n');
        }
        script
    }

    fn teardown_script(&self) -> String {
        format!(
            "delete chain ip {table} {chain}\ndelete table ip {table}\n",
            table = self.table,
            chain = self.chain,
        )
    }

    async fn commit(&self, script: String) -> Result<(), Error> {
        let mut child = Command::new("nft")
            .arg("-f")
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Kernel("nft stdin unavailable".to_string()))?;
        stdin.write_all(script.as_bytes()).await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(Error::Kernel(format!(
                "nft transaction failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl KernelHandle for NftKernelHandle {
    async fn ensure(&self) -> Result<(), Error> {
        self.commit(self.ensure_script()).await
    }

    async fn replace_rules(&self, rules: &[CompiledRule]) -> Result<(), Error> {
        self.commit(self.replace_script(rules)).await?;
        tracing::info!(
            "installed {} rules into ip {} {}",
            rules.len(),
            self.table,
            self.chain
        );
        Ok(())
    }

    async fn teardown(&self) -> Result<(), Error> {
        self.commit(self.teardown_script()).await?;
        tracing::info!("removed table ip {} and chain {}", self.table, self.chain);
        Ok(())
    }
}

/// Render one compiled rule as an nft statement, expressions in order.
fn render_rule(rule: &CompiledRule) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(rule.exprs.len() + 1);
    for expr in &rule.exprs {
        match expr {
            RuleExpr::L4Proto(proto) => parts.push(match proto {
                6 => "ip protocol tcp".to_string(),
                17 => "ip protocol udp".to_string(),
                n => format!("ip protocol {}", n),
            }),
            // raw transport-header match so the compare applies with or
            // without a preceding protocol match
            RuleExpr::DestPort(port) => parts.push(format!("th dport {}", port)),
            RuleExpr::Source(pred) => parts.push(render_source(pred)),
            RuleExpr::Dnat { addr, port } => parts.push(format!("dnat to {}:{}", addr, port)),
        }
    }
    parts.push(format!("comment \"{}\"", rule.user_data));
    parts.join(" ")
}

fn render_source(pred: &SourcePredicate) -> String {
    match pred {
        SourcePredicate::Exact(addr) => format!("ip saddr {}", addr),
        SourcePredicate::Masked {
            network,
            prefix_len,
        } => format!("ip saddr {}/{}", network, prefix_len),
        SourcePredicate::Range { start, end } => format!("ip saddr {}-{}", start, end),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compiled(rule_id: i64, exprs: Vec<RuleExpr>) -> CompiledRule {
        CompiledRule {
            rule_id,
            exprs,
            user_data: format!("rule_id:{}", rule_id),
        }
    }

    #[test]
    fn test_render_full_rule() {
        let rule = compiled(
            3,
            vec![
                RuleExpr::L4Proto(6),
                RuleExpr::DestPort(80),
                RuleExpr::Source(SourcePredicate::Masked {
                    network: "10.1.0.0".parse().unwrap(),
                    prefix_len: 16,
                }),
                RuleExpr::Dnat {
                    addr: "10.0.0.10".parse().unwrap(),
                    port: 80,
                },
            ],
        );
        assert_eq!(
            render_rule(&rule),
            "ip protocol tcp th dport 80 ip saddr 10.1.0.0/16 dnat to 10.0.0.10:80 comment \"rule_id:3\""
        );
    }

    #[test]
    fn test_render_rule_without_proto_match() {
        let rule = compiled(
            9,
            vec![
                RuleExpr::DestPort(53),
                RuleExpr::Source(SourcePredicate::Exact("192.168.1.1".parse().unwrap())),
                RuleExpr::Dnat {
                    addr: "10.0.0.5".parse().unwrap(),
                    port: 5353,
                },
            ],
        );
        assert_eq!(
            render_rule(&rule),
            "th dport 53 ip saddr 192.168.1.1 dnat to 10.0.0.5:5353 comment \"rule_id:9\""
        );
    }

    #[test]
    fn test_render_range_source() {
        let rule = compiled(
            1,
            vec![
                RuleExpr::L4Proto(17),
                RuleExpr::DestPort(514),
                RuleExpr::Source(SourcePredicate::Range {
                    start: "10.0.0.1".parse().unwrap(),
                    end: "10.0.0.100".parse().unwrap(),
                }),
                RuleExpr::Dnat {
                    addr: "10.2.0.1".parse().unwrap(),
                    port: 514,
                },
            ],
        );
        assert_eq!(
            render_rule(&rule),
            "ip protocol udp th dport 514 ip saddr 10.0.0.1-10.0.0.100 dnat to 10.2.0.1:514 comment \"rule_id:1\""
        );
    }

    #[test]
    fn test_ensure_script_is_declarative() {
        let handle = NftKernelHandle::new("nat", "prerouting");
        let script = handle.ensure_script();
        assert!(script.starts_with("table ip nat {"));
        assert!(script.contains("chain prerouting {"));
        assert!(script.contains("type nat hook prerouting priority filter;"));
        // declarative includes never flush
        assert!(!script.contains("flush"));
    }

    #[test]
    fn test_replace_script_flushes_then_appends_in_order() {
        let handle = NftKernelHandle::new("nat", "prerouting");
        let rules = vec![
            compiled(
                2,
                vec![
                    RuleExpr::DestPort(80),
                    RuleExpr::Source(SourcePredicate::Exact("1.1.1.1".parse().unwrap())),
                    RuleExpr::Dnat {
                        addr: "10.0.0.1".parse().unwrap(),
                        port: 80,
                    },
                ],
            ),
            compiled(
                5,
                vec![
                    RuleExpr::DestPort(443),
                    RuleExpr::Source(SourcePredicate::Exact("2.2.2.2".parse().unwrap())),
                    RuleExpr::Dnat {
                        addr: "10.0.0.2".parse().unwrap(),
                        port: 443,
                    },
                ],
            ),
        ];

        let script = handle.replace_script(&rules);
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines[0], "flush chain ip nat prerouting");
        assert!(lines[1].starts_with("add rule ip nat prerouting th dport 80"));
        assert!(lines[1].ends_with("comment \"rule_id:2\""));
        assert!(lines[2].starts_with("add rule ip nat prerouting th dport 443"));
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_replace_script_empty_ruleset_only_flushes() {
        let handle = NftKernelHandle::new("nat", "prerouting");
        assert_eq!(
            handle.replace_script(&[]),
            "flush chain ip nat prerouting\n"
        );
    }

    #[test]
    fn test_teardown_script_deletes_chain_then_table() {
        let handle = NftKernelHandle::new("nat", "prerouting");
        assert_eq!(
            handle.teardown_script(),
            "delete chain ip nat prerouting\ndelete table ip nat\n"
        );
    }
}
