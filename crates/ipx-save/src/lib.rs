//! Parser for `iptables-save` dumps.
//!
//! [`parse_save`] reads counted dumps (`iptables-save -c`), [`parse_plain`]
//! reads rule files without counters. [`Reconciler`] runs the parser against
//! a live source and an optional reference source and reports drift between
//! the two.

pub mod builder;
pub mod classifier;
pub mod counters;
pub mod error;
pub mod reconcile;
pub mod source;
pub mod tokenizer;

pub use builder::{RecordBuilder, parse, parse_plain, parse_save};
pub use classifier::{FLAG_ROWS, RuleField, SHADOWED_FIELDS, classify};
pub use counters::parse_counters;
pub use error::{ParseError, Result, SaveError};
pub use reconcile::{Drift, Reconciler, Reconciliation};
pub use source::{OpenSource, SaveSource, SourceKind};
pub use tokenizer::{Dialect, RuleTokenizer, RuleTokens};
