use crate::error::{Result, SaveError};
use crate::source::{OpenSource, SaveSource};
use crate::tokenizer::Dialect;
use ipx_core::{ExporterConfig, RuleSet};
use similar::{ChangeTag, TextDiff};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Parses the live dump, and the reference dump when one is configured
#[derive(Debug, Clone)]
pub struct Reconciler {
    live: SaveSource,
    reference: Option<SaveSource>,
}

/// Outcome of one reconcile pass
#[derive(Debug, Clone)]
pub struct Reconciliation {
    /// Authoritative result
    pub live: RuleSet,
    /// Comparison with the reference, when it was configured and parsed
    pub drift: Option<Drift>,
}

/// Live vs reference comparison, counters ignored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drift {
    pub reference: String,
    pub matches: bool,
    pub diff: Option<String>,
}

impl Reconciler {
    pub fn new(live: SaveSource) -> Self {
        Self {
            live,
            reference: None,
        }
    }

    pub fn with_reference(mut self, reference: SaveSource) -> Self {
        self.reference = Some(reference);
        self
    }

    /// Live source reads counters, the reference is a plain rule file
    pub fn from_config(config: &ExporterConfig) -> Self {
        let reconciler = Self::new(SaveSource::from_config(&config.live, Dialect::Counters));
        match &config.reference {
            Some(reference) => {
                reconciler.with_reference(SaveSource::from_config(reference, Dialect::Plain))
            }
            None => reconciler,
        }
    }

    pub fn live(&self) -> &SaveSource {
        &self.live
    }

    pub fn reference(&self) -> Option<&SaveSource> {
        self.reference.as_ref()
    }

    /// Parse only the live source, skipping any comparison
    pub async fn load(&self) -> Result<RuleSet> {
        let opened = self.live.open()?;
        join_parse(opened.name().to_string(), spawn_parse(opened)).await
    }

    /// Parse both sources concurrently and compare them.
    ///
    /// Both sources are opened before any parsing starts. A reference that
    /// fails to parse is logged and yields no drift report; the live result is
    /// still returned.
    pub async fn reconcile(&self) -> Result<Reconciliation> {
        let live = self.live.open()?;
        let reference = match self.reference.as_ref().map(SaveSource::open).transpose() {
            Ok(reference) => reference,
            Err(e) => {
                live.close();
                return Err(e);
            }
        };

        let live_name = live.name().to_string();
        let live_task = spawn_parse(live);
        let reference_task = reference.map(|opened| {
            let name = opened.name().to_string();
            (name, spawn_parse(opened))
        });

        let (live_result, reference_result) = match reference_task {
            Some((name, task)) => {
                let (live, reference) =
                    tokio::join!(join_parse(live_name, live_task), join_parse(name.clone(), task));
                (live, Some((name, reference)))
            }
            None => (join_parse(live_name, live_task).await, None),
        };

        let live = live_result?;
        let drift = match reference_result {
            Some((_, Ok(reference))) => Some(self.compare(&live, &reference)),
            Some((name, Err(e))) => {
                warn!(reference = %name, error = %e, "reference ruleset unavailable");
                None
            }
            None => None,
        };

        Ok(Reconciliation { live, drift })
    }

    fn compare(&self, live: &RuleSet, reference: &RuleSet) -> Drift {
        let name = self
            .reference
            .as_ref()
            .map(SaveSource::name)
            .unwrap_or_default();
        let drift = Drift::compare(name, live, reference);
        if drift.matches {
            debug!(reference = %drift.reference, "live ruleset matches reference");
        } else {
            warn!(reference = %drift.reference, "live ruleset differs from reference");
            if let Some(diff) = &drift.diff {
                debug!("ruleset drift:\n{}", diff);
            }
        }
        drift
    }
}

impl Drift {
    /// Compare two rule sets with their counters stripped
    pub fn compare(reference: impl Into<String>, live: &RuleSet, expected: &RuleSet) -> Self {
        let live = live.without_counters();
        let expected = expected.without_counters();

        if live == expected {
            return Self {
                reference: reference.into(),
                matches: true,
                diff: None,
            };
        }

        Self {
            reference: reference.into(),
            matches: false,
            diff: Some(render_diff(&render(&expected), &render(&live))),
        }
    }
}

fn spawn_parse(opened: OpenSource) -> JoinHandle<Result<RuleSet>> {
    tokio::task::spawn_blocking(move || opened.parse())
}

async fn join_parse(name: String, task: JoinHandle<Result<RuleSet>>) -> Result<RuleSet> {
    match task.await {
        Ok(result) => result,
        Err(e) => Err(SaveError::Task {
            name,
            message: e.to_string(),
        }),
    }
}

fn render(ruleset: &RuleSet) -> String {
    let mut text = serde_json::to_string_pretty(ruleset)
        .unwrap_or_else(|e| format!("<unrenderable ruleset: {}>", e));
    text.push('\n');
    text
}

fn render_diff(expected: &str, live: &str) -> String {
    let diff = TextDiff::from_lines(expected, live);
    let mut output = String::new();

    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => '-',
            ChangeTag::Insert => '+',
            ChangeTag::Equal => ' ',
        };
        output.push(sign);
        output.push_str(change.value());
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipx_core::SourceConfig;
    use std::path::PathBuf;

    fn testdata(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("testdata")
            .join(name)
    }

    fn live() -> SaveSource {
        SaveSource::file(testdata("server.iptables-save"), Dialect::Counters)
    }

    #[tokio::test]
    async fn test_reconcile_without_reference() {
        let result = Reconciler::new(live()).reconcile().await.unwrap();
        assert!(result.drift.is_none());
        assert_eq!(result.live.rule_count(), 8);
    }

    #[tokio::test]
    async fn test_matching_reference() {
        let reconciler = Reconciler::new(live()).with_reference(SaveSource::file(
            testdata("chef.iptables-save"),
            Dialect::Plain,
        ));
        let result = reconciler.reconcile().await.unwrap();
        let drift = result.drift.unwrap();
        assert!(drift.matches);
        assert!(drift.diff.is_none());
        // counters come from the live dump only
        assert_eq!(
            result.live.chain("filter", "INPUT").unwrap().packets,
            8202915326
        );
    }

    #[tokio::test]
    async fn test_drifted_reference() {
        let reconciler = Reconciler::new(live()).with_reference(SaveSource::file(
            testdata("chef-drift.iptables-save"),
            Dialect::Plain,
        ));
        let result = reconciler.reconcile().await.unwrap();
        let drift = result.drift.unwrap();
        assert!(!drift.matches);
        assert!(drift.reference.ends_with("chef-drift.iptables-save"));
        let diff = drift.diff.unwrap();
        assert!(diff.lines().any(|l| l.starts_with('-') && l.contains("22")));
        assert!(diff.lines().any(|l| l.starts_with('+') && l.contains("9042")));
    }

    #[tokio::test]
    async fn test_missing_reference_fails_before_parsing() {
        let reconciler = Reconciler::new(live()).with_reference(SaveSource::file(
            testdata("missing.iptables-save"),
            Dialect::Plain,
        ));
        match reconciler.reconcile().await {
            Err(SaveError::Open { name, .. }) => assert!(name.ends_with("missing.iptables-save")),
            other => panic!("expected open error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_live_fails() {
        let reconciler =
            Reconciler::new(SaveSource::file(testdata("missing.iptables-save"), Dialect::Counters));
        assert!(matches!(
            reconciler.load().await,
            Err(SaveError::Open { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_reference_keeps_live_result() {
        let reconciler = Reconciler::new(live()).with_reference(SaveSource::command(
            "false",
            Vec::<String>::new(),
            Dialect::Plain,
        ));
        let result = reconciler.reconcile().await.unwrap();
        assert!(result.drift.is_none());
        assert!(!result.live.is_empty());
    }

    #[tokio::test]
    async fn test_load_matches_reconcile() {
        let reconciler = Reconciler::new(live());
        let loaded = reconciler.load().await.unwrap();
        let reconciled = reconciler.reconcile().await.unwrap();
        assert_eq!(loaded, reconciled.live);
    }

    #[test]
    fn test_from_config_dialects() {
        let config = ExporterConfig {
            reference: Some(SourceConfig::File {
                path: PathBuf::from("/etc/iptables/managed.rules"),
            }),
            ..ExporterConfig::default()
        };
        let reconciler = Reconciler::from_config(&config);
        assert_eq!(reconciler.live().dialect(), Dialect::Counters);
        assert_eq!(reconciler.reference().unwrap().dialect(), Dialect::Plain);
        assert_eq!(
            reconciler.reference().unwrap().name(),
            "/etc/iptables/managed.rules"
        );
    }

    #[test]
    fn test_drift_ignores_counters() {
        let mut live = RuleSet::new();
        live.table_entry("filter").chain_entry("INPUT").packets = 10;
        let mut reference = RuleSet::new();
        reference.table_entry("filter").chain_entry("INPUT");

        assert!(Drift::compare("ref", &live, &reference).matches);

        reference.table_entry("filter").chain_entry("INPUT").policy = "DROP".into();
        let drift = Drift::compare("ref", &live, &reference);
        assert!(!drift.matches);
        let diff = drift.diff.unwrap();
        assert!(
            diff.lines()
                .any(|l| l.starts_with('-') && l.contains("\"policy\": \"DROP\""))
        );
    }
}
