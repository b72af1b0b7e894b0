//! Maps tokenized rule flags onto [`Rule`] fields.
//!
//! The flag list is regrouped into fragments at every token that starts with
//! `-` outside a quoted value, which yields `name value...` fragments with the
//! dashes stripped (`--dport 7000` becomes `dport 7000`). Each fragment is
//! then matched against [`FLAG_ROWS`].

use ipx_core::{DEFAULT_ADDRESS, Rule};
use regex::Regex;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleField {
    Destination,
    DestinationPort,
    Match,
    Protocol,
    Source,
    SourcePort,
    Target,
    ChefSync,
}

/// Flag patterns in priority order.
///
/// Rows are tried top to bottom and only the first matching row is applied to
/// a fragment. The `ChefSync` row repeats the `Target` pattern, so it can never
/// match; see [`SHADOWED_FIELDS`].
pub const FLAG_ROWS: &[(&str, RuleField)] = &[
    (r"^(?:d|destination)\s+(.+)$", RuleField::Destination),
    (
        r"^(?:dports?|destination-port)\s+(.+)$",
        RuleField::DestinationPort,
    ),
    (r"^(?:m|match|comment)\s+(.+)$", RuleField::Match),
    (r"^(?:p|protocol)\s+(.+)$", RuleField::Protocol),
    (r"^(?:s|source)\s+(.+)$", RuleField::Source),
    (r"^(?:sports?|source-port)\s+(.+)$", RuleField::SourcePort),
    (r"^(?:j|jump)\s+(.+)$", RuleField::Target),
    (r"^(?:j|jump)\s+(.+)$", RuleField::ChefSync),
];

/// Fields whose rows are unreachable under first-match dispatch.
pub const SHADOWED_FIELDS: &[RuleField] = &[RuleField::ChefSync];

static FLAG_TABLE: LazyLock<Vec<(Regex, RuleField)>> = LazyLock::new(|| {
    FLAG_ROWS
        .iter()
        .map(|(pattern, field)| {
            let regex = Regex::new(pattern).expect("flag pattern must compile");
            (regex, *field)
        })
        .collect()
});

/// Build a rule from the flag list of one rule line.
///
/// Counters are left at zero; the caller fills them from the tokenizer.
pub fn classify(flags: &[String]) -> Rule {
    let mut rule = Rule::default();

    for fragment in fragments(flags) {
        classify_fragment(&mut rule, &fragment);
    }

    if rule.destination.is_empty() {
        rule.destination = DEFAULT_ADDRESS.to_string();
    }
    if rule.source.is_empty() {
        rule.source = DEFAULT_ADDRESS.to_string();
    }

    rule
}

/// Apply the first row matching `fragment`, returning the field it set
pub fn classify_fragment(rule: &mut Rule, fragment: &str) -> Option<RuleField> {
    let (field, rest) = FLAG_TABLE.iter().find_map(|(regex, field)| {
        regex
            .captures(fragment)
            .and_then(|caps| caps.get(1))
            .map(|rest| (*field, rest.as_str()))
    })?;
    let value = first_value(rest);

    match field {
        RuleField::Destination => rule.destination = value.to_string(),
        RuleField::DestinationPort => rule.destination_port = value.parse().unwrap_or(0),
        RuleField::Match => rule.r#match = value.to_string(),
        RuleField::Protocol => rule.protocol = value.to_string(),
        RuleField::Source => rule.source = value.to_string(),
        RuleField::SourcePort => rule.source_port = value.parse().unwrap_or(0),
        RuleField::Target => rule.target = value.to_string(),
        RuleField::ChefSync => rule.chef_sync = value.to_string(),
    }

    Some(field)
}

// Split at flag tokens, keeping `"..."` runs whole so `--comment "a -b"`
// stays one fragment.
fn fragments(flags: &[String]) -> Vec<String> {
    let mut fragments = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for token in flags {
        if !quoted && token.starts_with('-') {
            if !current.is_empty() {
                fragments.push(std::mem::take(&mut current));
            }
            current.push_str(token.trim_start_matches('-'));
        } else {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(token);
        }
        if unescaped_quotes(token) % 2 == 1 {
            quoted = !quoted;
        }
    }
    if !current.is_empty() {
        fragments.push(current);
    }

    fragments
}

fn unescaped_quotes(token: &str) -> usize {
    let mut count = 0;
    let mut escaped = false;
    for c in token.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => count += 1,
            _ => {}
        }
    }
    count
}

// First word, or the whole quoted string when the value is quoted.
fn first_value(rest: &str) -> &str {
    let rest = rest.trim_start();
    if let Some(quoted) = rest.strip_prefix('"') {
        return match quoted.find('"') {
            Some(end) => &quoted[..end],
            None => quoted,
        };
    }
    rest.split_whitespace().next().unwrap_or("")
}
