use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Address recorded for rules that never set `-s` or `-d`.
pub const DEFAULT_ADDRESS: &str = "0.0.0.0/32";

/// Parsed dump: table name -> table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleSet {
    pub tables: BTreeMap<String, Table>,
}

/// Chain name -> chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Table {
    pub chains: BTreeMap<String, Chain>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chain {
    /// Default verdict, empty for user-defined chains.
    pub policy: String,
    pub packets: u64,
    pub bytes: u64,
    /// Rules in evaluation order.
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub protocol: String,
    pub r#match: String,
    pub source: String,
    pub destination: String,
    /// 0 when the rule has no single source port.
    pub source_port: u16,
    /// 0 when the rule has no single destination port.
    pub destination_port: u16,
    pub target: String,
    /// Shares its pattern with `target` in the flag table and loses the
    /// first-match dispatch, so it is never populated.
    pub chef_sync: String,
    pub packets: u64,
    pub bytes: u64,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    pub fn chain(&self, table: &str, chain: &str) -> Option<&Chain> {
        self.tables.get(table).and_then(|t| t.chains.get(chain))
    }

    /// Fetch a table, creating an empty one on first use
    pub fn table_entry(&mut self, name: &str) -> &mut Table {
        self.tables.entry(name.to_string()).or_default()
    }

    pub fn chain_count(&self) -> usize {
        self.tables.values().map(|t| t.chains.len()).sum()
    }

    pub fn rule_count(&self) -> usize {
        self.tables.values().map(Table::rule_count).sum()
    }

    /// Copy of the rule set with every packet and byte counter zeroed.
    ///
    /// A counted live dump and an uncounted reference dump compare equal
    /// through this view when their rules agree.
    pub fn without_counters(&self) -> RuleSet {
        let mut stripped = self.clone();
        for table in stripped.tables.values_mut() {
            for chain in table.chains.values_mut() {
                chain.packets = 0;
                chain.bytes = 0;
                for rule in &mut chain.rules {
                    rule.packets = 0;
                    rule.bytes = 0;
                }
            }
        }
        stripped
    }

    pub fn display(&self) {
        println!("🔥 iptables ruleset\n");

        if self.tables.is_empty() {
            println!("  (no tables)");
            return;
        }

        for (table_name, table) in &self.tables {
            println!(
                "📋 {} ({} chains, {} rules)",
                table_name,
                table.chains.len(),
                table.rule_count()
            );
            for (chain_name, chain) in &table.chains {
                let policy = if chain.policy.is_empty() {
                    "-"
                } else {
                    chain.policy.as_str()
                };
                println!(
                    "  • {} [{}] {} packets, {} bytes",
                    chain_name, policy, chain.packets, chain.bytes
                );
                for rule in &chain.rules {
                    println!("    {}", rule);
                }
            }
            println!();
        }
    }
}

impl Table {
    pub fn rule_count(&self) -> usize {
        self.chains.values().map(|c| c.rules.len()).sum()
    }

    /// Fetch a chain, creating one with an empty policy on first use
    pub fn chain_entry(&mut self, name: &str) -> &mut Chain {
        self.chains.entry(name.to_string()).or_default()
    }
}

impl Chain {
    pub fn new(policy: impl Into<String>, packets: u64, bytes: u64) -> Self {
        Self {
            policy: policy.into(),
            packets,
            bytes,
            rules: vec![],
        }
    }
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let protocol = if self.protocol.is_empty() {
            "all"
        } else {
            self.protocol.as_str()
        };
        write!(f, "{} {}", protocol, self.source)?;
        if self.source_port != 0 {
            write!(f, ":{}", self.source_port)?;
        }
        write!(f, " -> {}", self.destination)?;
        if self.destination_port != 0 {
            write!(f, ":{}", self.destination_port)?;
        }
        if !self.target.is_empty() {
            write!(f, " => {}", self.target)?;
        }
        if !self.r#match.is_empty() {
            write!(f, " ({})", self.r#match)?;
        }
        write!(f, " [{} packets, {} bytes]", self.packets, self.bytes)
    }
}
