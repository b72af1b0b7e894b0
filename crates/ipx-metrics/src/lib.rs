use anyhow::{Result, anyhow, bail};
use axum::{Router, response::Html, routing::get};
use ipx_core::{ExporterConfig, RuleSet};
use ipx_save::{Drift, Reconciler};
use prometheus::{
    Encoder, Gauge, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{error, info};

const RULE_LABELS: &[&str] = &[
    "table",
    "chain",
    "destination",
    "dport",
    "source",
    "sport",
    "target",
    "protocol",
    "match",
];

/// Prometheus metrics for one iptables scrape
pub struct MetricsCollector {
    registry: Arc<Registry>,

    // Scrape metrics
    scrape_duration: Gauge,
    scrape_success: IntGauge,

    // Chain default policy metrics
    default_packets: IntCounterVec,
    default_bytes: IntCounterVec,

    // Rule metrics
    rule_packets: IntCounterVec,
    rule_bytes: IntCounterVec,

    // Reference drift
    reference_match: IntGaugeVec,
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        // Scrape metrics
        let scrape_duration = Gauge::with_opts(Opts::new(
            "iptables_scrape_duration_seconds",
            "iptables_exporter: Duration of scraping iptables.",
        ))?;
        registry.register(Box::new(scrape_duration.clone()))?;

        let scrape_success = IntGauge::with_opts(Opts::new(
            "iptables_scrape_success",
            "iptables_exporter: Whether scraping iptables succeeded.",
        ))?;
        registry.register(Box::new(scrape_success.clone()))?;

        // Chain default policy metrics
        let default_packets = IntCounterVec::new(
            Opts::new(
                "iptables_default_packets_total",
                "iptables_exporter: Total packets matching a chain's default policy.",
            ),
            &["table", "chain", "policy"],
        )?;
        registry.register(Box::new(default_packets.clone()))?;

        let default_bytes = IntCounterVec::new(
            Opts::new(
                "iptables_default_bytes_total",
                "iptables_exporter: Total bytes matching a chain's default policy.",
            ),
            &["table", "chain", "policy"],
        )?;
        registry.register(Box::new(default_bytes.clone()))?;

        // Rule metrics
        let rule_packets = IntCounterVec::new(
            Opts::new(
                "iptables_rule_packets_total",
                "iptables_exporter: Total packets matching a rule.",
            ),
            RULE_LABELS,
        )?;
        registry.register(Box::new(rule_packets.clone()))?;

        let rule_bytes = IntCounterVec::new(
            Opts::new(
                "iptables_rule_bytes_total",
                "iptables_exporter: Total bytes matching a rule.",
            ),
            RULE_LABELS,
        )?;
        registry.register(Box::new(rule_bytes.clone()))?;

        // Reference drift
        let reference_match = IntGaugeVec::new(
            Opts::new(
                "iptables_reference_match",
                "iptables_exporter: Whether the live rules match the reference rules (1=match, 0=drift).",
            ),
            &["reference"],
        )?;
        registry.register(Box::new(reference_match.clone()))?;

        Ok(Self {
            registry,
            scrape_duration,
            scrape_success,
            default_packets,
            default_bytes,
            rule_packets,
            rule_bytes,
            reference_match,
        })
    }

    /// Drop every per-chain and per-rule series from the previous scrape
    pub fn reset(&self) {
        self.default_packets.reset();
        self.default_bytes.reset();
        self.rule_packets.reset();
        self.rule_bytes.reset();
        self.reference_match.reset();
    }

    /// Export counters for every enabled chain and its rules
    pub fn update_ruleset(&self, ruleset: &RuleSet, config: &ExporterConfig) {
        for (table_name, table) in &ruleset.tables {
            for (chain_name, chain) in &table.chains {
                if !config.chain_enabled(chain_name) {
                    continue;
                }

                let chain_labels: [&str; 3] =
                    [table_name.as_str(), chain_name.as_str(), chain.policy.as_str()];
                self.default_packets
                    .with_label_values(&chain_labels)
                    .inc_by(chain.packets);
                self.default_bytes
                    .with_label_values(&chain_labels)
                    .inc_by(chain.bytes);

                for rule in &chain.rules {
                    let dport = rule.destination_port.to_string();
                    let sport = rule.source_port.to_string();
                    let rule_labels: [&str; 9] = [
                        table_name.as_str(),
                        chain_name.as_str(),
                        rule.destination.as_str(),
                        dport.as_str(),
                        rule.source.as_str(),
                        sport.as_str(),
                        rule.target.as_str(),
                        rule.protocol.as_str(),
                        rule.r#match.as_str(),
                    ];
                    self.rule_packets
                        .with_label_values(&rule_labels)
                        .inc_by(rule.packets);
                    self.rule_bytes
                        .with_label_values(&rule_labels)
                        .inc_by(rule.bytes);
                }
            }
        }
    }

    /// Record the live vs reference comparison
    pub fn update_drift(&self, drift: &Drift) {
        self.reference_match
            .with_label_values(&[drift.reference.as_str()])
            .set(if drift.matches { 1 } else { 0 });
    }

    /// Record scrape duration and outcome
    pub fn record_scrape(&self, seconds: f64, success: bool) {
        self.scrape_duration.set(seconds);
        self.scrape_success.set(if success { 1 } else { 0 });
    }

    /// Render metrics in Prometheus text format
    pub fn render_metrics(&self) -> Result<String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics collector")
    }
}

/// Runs one reconcile pass per scrape and renders the result
pub struct Scraper {
    collector: RwLock<MetricsCollector>,
    reconciler: Reconciler,
    config: ExporterConfig,
}

impl Scraper {
    pub fn new(collector: MetricsCollector, config: ExporterConfig) -> Self {
        let reconciler = Reconciler::from_config(&config);
        Self::with_reconciler(collector, reconciler, config)
    }

    pub fn with_reconciler(
        collector: MetricsCollector,
        reconciler: Reconciler,
        config: ExporterConfig,
    ) -> Self {
        Self {
            collector: RwLock::new(collector),
            reconciler,
            config,
        }
    }

    /// Parse the sources, refresh every series and render them.
    ///
    /// A failed or empty parse is reported through `iptables_scrape_success`
    /// rather than as an error.
    pub async fn scrape(&self) -> Result<String> {
        let collector = self.collector.write().await;
        collector.reset();

        let start = Instant::now();
        let result = self.reconciler.reconcile().await.map_err(anyhow::Error::from).and_then(
            |reconciliation| {
                if reconciliation.live.is_empty() {
                    Err(anyhow!(
                        "no output from iptables-save; this is probably due to insufficient permissions"
                    ))
                } else {
                    Ok(reconciliation)
                }
            },
        );
        let seconds = start.elapsed().as_secs_f64();

        match result {
            Ok(reconciliation) => {
                collector.record_scrape(seconds, true);
                collector.update_ruleset(&reconciliation.live, &self.config);
                if let Some(drift) = &reconciliation.drift {
                    collector.update_drift(drift);
                }
            }
            Err(e) => {
                collector.record_scrape(seconds, false);
                error!("{:#}", e);
            }
        }

        collector.render_metrics()
    }
}

/// HTTP server for Prometheus metrics endpoint
pub struct MetricsServer {
    scraper: Arc<Scraper>,
    addr: std::net::SocketAddr,
    telemetry_path: String,
}

impl MetricsServer {
    pub fn new(scraper: Scraper, config: &ExporterConfig) -> Result<Self> {
        let telemetry_path = &config.telemetry_path;
        if !telemetry_path.starts_with('/') {
            bail!("Telemetry path '{}' must start with '/'", telemetry_path);
        }
        if telemetry_path.contains([':', '*', '{', '}']) {
            bail!("Telemetry path '{}' must be a literal path", telemetry_path);
        }

        Ok(Self {
            scraper: Arc::new(scraper),
            addr: config.socket_addr()?,
            telemetry_path: telemetry_path.clone(),
        })
    }

    pub fn router(&self) -> Router {
        let scraper = self.scraper.clone();
        let router = Router::new().route(
            &self.telemetry_path,
            get(move || {
                let scraper = scraper.clone();
                async move {
                    match scraper.scrape().await {
                        Ok(metrics) => metrics,
                        Err(e) => format!("# Error rendering metrics: {}", e),
                    }
                }
            }),
        );

        // metrics served at the root replace the index page
        if self.telemetry_path == "/" {
            return router;
        }

        let index = index_page(&self.telemetry_path);
        router.route(
            "/",
            get(move || {
                let index = index.clone();
                async move { Html(index) }
            }),
        )
    }

    /// Start the metrics HTTP server
    pub async fn serve(self) -> Result<()> {
        let app = self.router();

        info!(
            "Metrics server listening on http://{}{}",
            self.addr, self.telemetry_path
        );

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

fn index_page(telemetry_path: &str) -> String {
    format!(
        "<html>\n\
         <head><title>iptables exporter</title></head>\n\
         <body>\n\
         <h1>iptables exporter</h1>\n\
         <p><a href=\"{}\">Metrics</a></p>\n\
         </body>\n\
         </html>\n",
        telemetry_path
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipx_core::SourceConfig;
    use ipx_save::{Dialect, SaveSource};
    use std::path::PathBuf;

    fn testdata(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../ipx-save/testdata")
            .join(name)
    }

    fn file_config(live: &str, reference: Option<&str>) -> ExporterConfig {
        ExporterConfig {
            live: SourceConfig::File {
                path: testdata(live),
            },
            reference: reference.map(|name| SourceConfig::File {
                path: testdata(name),
            }),
            ..ExporterConfig::default()
        }
    }

    #[test]
    fn test_metrics_collector_creation() {
        let collector = MetricsCollector::new();
        assert!(collector.is_ok());
    }

    #[test]
    fn test_metrics_rendering() {
        let collector = MetricsCollector::new().unwrap();
        let ruleset = ipx_save::parse_save(
            std::fs::read_to_string(testdata("server.iptables-save"))
                .unwrap()
                .as_bytes(),
        )
        .unwrap();

        collector.record_scrape(0.25, true);
        collector.update_ruleset(&ruleset, &ExporterConfig::default());

        let output = collector.render_metrics().unwrap();
        assert!(output.contains("iptables_scrape_success 1"));
        assert!(output.contains("iptables_scrape_duration_seconds 0.25"));
        assert!(output.contains(
            "iptables_default_packets_total{chain=\"INPUT\",policy=\"ACCEPT\",table=\"filter\"} 8202915326"
        ));
        assert!(output.contains(
            "iptables_rule_bytes_total{chain=\"INPUT\",destination=\"0.0.0.0/32\",dport=\"7000\",match=\"tcp\",protocol=\"tcp\",source=\"0.0.0.0/32\",sport=\"0\",table=\"filter\",target=\"ACCEPT\"} 1536987862973"
        ));
        assert!(output.contains("iptables_rule_packets_total"));
        assert!(output.contains("iptables_default_bytes_total"));
    }

    #[test]
    fn test_disabled_chains_are_skipped() {
        let collector = MetricsCollector::new().unwrap();
        let ruleset = ipx_save::parse_save(
            std::fs::read_to_string(testdata("server.iptables-save"))
                .unwrap()
                .as_bytes(),
        )
        .unwrap();
        let config = ExporterConfig {
            enabled_chains: vec!["OUTPUT".into()],
            ..ExporterConfig::default()
        };

        collector.update_ruleset(&ruleset, &config);

        let output = collector.render_metrics().unwrap();
        assert!(output.contains("chain=\"OUTPUT\""));
        assert!(!output.contains("chain=\"INPUT\""));
        assert!(!output.contains("chain=\"PREROUTING\""));
    }

    #[test]
    fn test_reset_drops_old_series() {
        let collector = MetricsCollector::new().unwrap();
        let mut ruleset = RuleSet::new();
        ruleset.table_entry("filter").chain_entry("STALE").packets = 3;
        collector.update_ruleset(&ruleset, &ExporterConfig::default());
        assert!(collector.render_metrics().unwrap().contains("STALE"));

        collector.reset();
        assert!(!collector.render_metrics().unwrap().contains("STALE"));
    }

    #[tokio::test]
    async fn test_scrape_with_reference() {
        let config = file_config("server.iptables-save", Some("chef-drift.iptables-save"));
        let scraper = Scraper::new(MetricsCollector::new().unwrap(), config);

        let output = scraper.scrape().await.unwrap();
        assert!(output.contains("iptables_scrape_success 1"));
        assert!(output.contains("iptables_reference_match{reference="));
        assert!(output.contains("chef-drift.iptables-save\"} 0"));
    }

    #[tokio::test]
    async fn test_failed_scrape_reports_failure() {
        let config = file_config("missing.iptables-save", None);
        let scraper = Scraper::new(MetricsCollector::new().unwrap(), config);

        let output = scraper.scrape().await.unwrap();
        assert!(output.contains("iptables_scrape_success 0"));
        assert!(!output.contains("iptables_rule_packets_total{"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_empty_scrape_reports_failure() {
        let reconciler = Reconciler::new(SaveSource::command(
            "true",
            Vec::<String>::new(),
            Dialect::Counters,
        ));
        let scraper = Scraper::with_reconciler(
            MetricsCollector::new().unwrap(),
            reconciler,
            ExporterConfig::default(),
        );

        let output = scraper.scrape().await.unwrap();
        assert!(output.contains("iptables_scrape_success 0"));
    }

    fn server_with_path(path: &str) -> Result<MetricsServer> {
        let config = ExporterConfig {
            listen_address: "127.0.0.1:0".into(),
            telemetry_path: path.into(),
            ..file_config("server.iptables-save", None)
        };
        let scraper = Scraper::new(MetricsCollector::new().unwrap(), config.clone());
        MetricsServer::new(scraper, &config)
    }

    #[test]
    fn test_relative_telemetry_path_rejected() {
        let err = server_with_path("metrics").err().unwrap();
        assert!(err.to_string().contains("must start with '/'"));
        assert!(server_with_path("").is_err());
        assert!(server_with_path("/{name}").is_err());
        assert!(server_with_path("/:name").is_err());
    }

    #[test]
    fn test_router_accepts_custom_and_root_paths() {
        let server = server_with_path("/stats").unwrap();
        let _ = server.router();

        // would overlap the index route if it were registered
        let server = server_with_path("/").unwrap();
        let _ = server.router();
    }

    #[test]
    fn test_index_page_links_metrics() {
        assert!(index_page("/stats").contains("<a href=\"/stats\">Metrics</a>"));
    }
}
