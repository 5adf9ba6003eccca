use std::path::PathBuf;

use serde::Serialize;
use tracing::info;

use quotad::model::{AuditFinding, QuotaFilter, QuotaView};
use quotad::tenant::TenantManager;

#[derive(Serialize)]
struct TenantReport {
    tenant: String,
    compacted: bool,
    quotas: Vec<QuotaView>,
    findings: Vec<AuditFinding>,
}

/// Replay every tenant log in the data directory, audit it, compact it when
/// clean, and print a JSON report. Exits with status 1 if any audit finding.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let data_dir = std::env::var("QUOTAD_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let compact = std::env::var("QUOTAD_COMPACT")
        .map(|v| !matches!(v.as_str(), "0" | "false" | "no" | "off"))
        .unwrap_or(true);
    let compact_threshold: u64 = std::env::var("QUOTAD_COMPACT_THRESHOLD")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);

    std::fs::create_dir_all(&data_dir)?;
    info!("quotad audit");
    info!("  data_dir: {data_dir}");
    info!("  compact: {compact}");

    let tenants = TenantManager::new(PathBuf::from(&data_dir), compact_threshold);
    let mut reports = Vec::new();
    let mut total_findings = 0usize;

    for name in tenants.discover()? {
        let engine = tenants.get_or_create(&name)?;
        let quotas = engine.list_quotas(&QuotaFilter::default()).await;
        let findings = engine.audit().await;
        for finding in &findings {
            tracing::error!("{name}: {finding:?}");
        }

        // Never rewrite a log whose state fails the audit.
        let compacted = compact && findings.is_empty();
        if compacted {
            engine.compact_wal().await?;
        }

        info!(
            "{name}: {} quotas, {} findings{}",
            quotas.len(),
            findings.len(),
            if compacted { ", compacted" } else { "" }
        );
        total_findings += findings.len();
        reports.push(TenantReport {
            tenant: name,
            compacted,
            quotas,
            findings,
        });
    }

    println!("{}", serde_json::to_string_pretty(&reports)?);

    if total_findings > 0 {
        tracing::warn!("{total_findings} audit findings");
        std::process::exit(1);
    }
    Ok(())
}
