use crate::classifier::classify;
use crate::counters::parse_counters;
use crate::error::ParseError;
use crate::tokenizer::{Dialect, RuleTokenizer};
use ipx_core::RuleSet;
use std::io::BufRead;
use tracing::{debug, trace};

/// Parse `iptables-save -c` output
pub fn parse_save<R: BufRead>(reader: R) -> Result<RuleSet, ParseError> {
    parse(reader, Dialect::Counters)
}

/// Parse a plain rule file without counters
pub fn parse_plain<R: BufRead>(reader: R) -> Result<RuleSet, ParseError> {
    parse(reader, Dialect::Plain)
}

/// Parse a stream line by line.
///
/// Lines are decoded lossily, so stray non-UTF-8 bytes (usually inside a
/// `--comment`) are replaced rather than failing the parse. Only I/O errors
/// are fatal.
pub fn parse<R: BufRead>(mut reader: R, dialect: Dialect) -> Result<RuleSet, ParseError> {
    let mut builder = RecordBuilder::new(dialect);
    let mut buf = Vec::new();
    let mut line_number = 0;
    loop {
        buf.clear();
        line_number += 1;
        let read = reader
            .read_until(b'\n', &mut buf)
            .map_err(|source| ParseError::Read {
                line: line_number,
                source,
            })?;
        if read == 0 {
            break;
        }
        builder.feed_line(&String::from_utf8_lossy(&buf));
    }
    let ruleset = builder.finish();
    debug!(
        tables = ruleset.tables.len(),
        chains = ruleset.chain_count(),
        rules = ruleset.rule_count(),
        "parsed ruleset"
    );
    Ok(ruleset)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Start,
    InTable(String),
}

/// Line-by-line state machine assembling a [`RuleSet`]
#[derive(Debug)]
pub struct RecordBuilder {
    dialect: Dialect,
    state: State,
    ruleset: RuleSet,
}

impl RecordBuilder {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            state: State::Start,
            ruleset: RuleSet::new(),
        }
    }

    pub fn feed_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return;
        }

        if let Some(name) = line.strip_prefix('*') {
            self.open_table(name.trim());
            return;
        }

        if line == "COMMIT" {
            self.state = State::Start;
            return;
        }

        let State::InTable(table) = &self.state else {
            trace!(line, "skipping line outside a table section");
            return;
        };
        let table = table.clone();

        if let Some(declaration) = line.strip_prefix(':') {
            self.declare_chain(&table, declaration);
        } else if line.starts_with('[') || line.starts_with('-') {
            self.append_rule(&table, line);
        } else {
            trace!(line, "skipping unrecognized line");
        }
    }

    pub fn finish(self) -> RuleSet {
        self.ruleset
    }

    fn open_table(&mut self, name: &str) {
        if name.is_empty() {
            trace!("skipping table marker without a name");
            return;
        }
        self.ruleset.table_entry(name);
        self.state = State::InTable(name.to_string());
    }

    // `:<chain> <policy> [<packets>:<bytes>]`
    fn declare_chain(&mut self, table: &str, declaration: &str) {
        let mut fields = declaration.split_whitespace();
        let Some(name) = fields.next() else {
            trace!(table, "skipping chain declaration without a name");
            return;
        };
        let policy = match fields.next() {
            Some("-") | None => "",
            Some(policy) => policy,
        };
        let (packets, bytes) = fields.next().and_then(parse_counters).unwrap_or((0, 0));

        let chain = self.ruleset.table_entry(table).chain_entry(name);
        chain.policy = policy.to_string();
        chain.packets = packets;
        chain.bytes = bytes;
    }

    fn append_rule(&mut self, table: &str, line: &str) {
        let tokens = RuleTokenizer::tokenize(self.dialect, line);
        let Some(chain_name) = tokens.chain else {
            trace!(line, "skipping rule line without -A");
            return;
        };

        let mut rule = classify(&tokens.flags);
        rule.packets = tokens.packets;
        rule.bytes = tokens.bytes;

        let table = self.ruleset.table_entry(table);
        if !table.chains.contains_key(&chain_name) {
            debug!(chain = %chain_name, "rule references undeclared chain");
        }
        table.chain_entry(&chain_name).rules.push(rule);
    }
}
