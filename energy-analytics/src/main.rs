use std::env;

use anyhow::{anyhow, bail, Result};
use energy_analytics::{
    config::{AppConfig, SourceKind},
    observability,
    pipeline::{collect_readings, ReadingQuery, ReportSink},
    report::{build_report, ReportInput},
    sinks::JsonFileSink,
    sources::ConfiguredSource,
    window::AnalysisWindow,
};
use readings_client::db;
use sqlx::postgres::{PgPool, PgPoolOptions};
use time::{macros::format_description, Date, Duration, OffsetDateTime};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        bail!("usage: energy-analytics <window-end-date YYYY-MM-DD>");
    }
    let end_date = Date::parse(&args[1], format_description!("[year]-[month]-[day]"))
        .map_err(|e| anyhow!("invalid window end date '{}': {e}", args[1]))?;

    let cfg = AppConfig::load()?;
    let offset = cfg.analytics.site.utc_offset()?;
    let end = end_date.midnight().assume_offset(offset);
    let start = end - Duration::days(i64::from(cfg.report.window_days));
    let window = AnalysisWindow::new(start, end)?.with_baseline_weeks(cfg.analytics.baseline.weeks);

    let needs_pool = cfg.source.kind == SourceKind::Questdb
        || cfg.report.channels.is_empty()
        || cfg.report.historical_peak_kw.is_none();
    let pool: Option<PgPool> = match (&cfg.questdb, needs_pool) {
        (Some(q), true) => Some(
            PgPoolOptions::new()
                .max_connections(q.max_connections)
                .connect(&q.uri)
                .await?,
        ),
        (None, true) if cfg.source.kind == SourceKind::Questdb || cfg.report.channels.is_empty() => {
            bail!("[questdb] section is required to query the reading store")
        }
        _ => None,
    };

    let channels = if cfg.report.channels.is_empty() {
        let pool = pool.as_ref().ok_or_else(|| anyhow!("no store connection for channel lookup"))?;
        db::channels_for_site(pool, &cfg.report.site_id).await?
    } else {
        cfg.report.channels.clone()
    };
    if channels.is_empty() {
        bail!("site {} has no channels", cfg.report.site_id);
    }
    let channel_ids: Vec<i64> = channels.iter().map(|c| c.channel_id).collect();

    let historical_peak_kw = match (cfg.report.historical_peak_kw, &pool) {
        (Some(kw), _) => Some(kw),
        (None, Some(pool)) => {
            let totals: Vec<i64> = channels
                .iter()
                .filter(|c| c.is_site_total)
                .map(|c| c.channel_id)
                .collect();
            let ids = if totals.is_empty() { &channel_ids } else { &totals };
            let lookback = window.current.start - cfg.analytics.demand.ratchet_lookback();
            let peak = db::peak_load_in_range(pool, ids, lookback, window.current.start).await?;
            tracing::info!(from = %lookback, peak_kw = ?peak, "historical peak from store");
            peak
        }
        (None, None) => None,
    };

    let source = ConfiguredSource::from_config(&cfg, pool)?;

    tracing::info!(
        site_id = %cfg.report.site_id,
        start = %window.current.start,
        end = %window.current.end,
        channels = channel_ids.len(),
        "weekly report starting"
    );

    let current = ReadingQuery {
        channel_ids: channel_ids.clone(),
        start: window.current.start,
        end: window.current.end,
    };
    let readings = collect_readings(&source, &current).await?;
    let baseline_readings = match window.baseline {
        Some(span) => {
            let query = ReadingQuery {
                channel_ids,
                start: span.start,
                end: span.end,
            };
            collect_readings(&source, &query).await?
        }
        None => Vec::new(),
    };

    let input = ReportInput {
        site_id: &cfg.report.site_id,
        channels: &channels,
        readings: &readings,
        baseline_readings: &baseline_readings,
        window,
        historical_peak_kw,
        generated_at: OffsetDateTime::now_utc(),
    };
    let report = build_report(&input, &cfg.analytics)?;
    for w in &report.warnings {
        tracing::warn!(section = w.section, message = %w.message, "report section skipped");
    }

    let sink = JsonFileSink::new(&cfg.report.output_dir);
    let path = sink.write(&report).await?;
    tracing::info!(
        report_id = %report.report_id,
        path = %path.display(),
        findings = report.findings.len(),
        weekly_savings_usd = report.summary.weekly_savings_usd,
        "weekly report complete"
    );

    Ok(())
}
