use anyhow::{anyhow, bail, Result};
use energy_analytics::{
    analyze::sensor_health::analyze_sensor_health,
    config::{AppConfig, SourceKind},
    observability,
    pipeline::{collect_readings, ReadingQuery},
    series::{group_by_channel, ChannelSeries},
    sources::ConfiguredSource,
    window::Span,
};
use readings_client::db;
use sqlx::postgres::PgPoolOptions;
use std::env;
use time::{macros::format_description, Date};

/// Completeness audit over an arbitrary date range: coverage, missing-day
/// ranges to backfill and partial days, per channel.
#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        bail!("usage: sensor_audit <start-date YYYY-MM-DD> <end-date YYYY-MM-DD>");
    }
    let fmt = format_description!("[year]-[month]-[day]");
    let start_date = Date::parse(&args[1], fmt).map_err(|e| anyhow!("invalid start date '{}': {e}", args[1]))?;
    let end_date = Date::parse(&args[2], fmt).map_err(|e| anyhow!("invalid end date '{}': {e}", args[2]))?;

    let cfg = AppConfig::load()?;
    let offset = cfg.analytics.site.utc_offset()?;
    let span = Span::new(
        start_date.midnight().assume_offset(offset),
        end_date.midnight().assume_offset(offset),
    )?;

    let pool = match &cfg.questdb {
        Some(q) => Some(
            PgPoolOptions::new()
                .max_connections(q.max_connections)
                .connect(&q.uri)
                .await?,
        ),
        None if cfg.source.kind == SourceKind::Questdb || cfg.report.channels.is_empty() => {
            bail!("[questdb] section is required to query the reading store")
        }
        None => None,
    };

    let channels = match (&pool, cfg.report.channels.is_empty()) {
        (Some(pool), true) => db::channels_for_site(pool, &cfg.report.site_id).await?,
        _ => cfg.report.channels.clone(),
    };
    let channel_ids: Vec<i64> = channels.iter().map(|c| c.channel_id).collect();
    if channel_ids.is_empty() {
        bail!("site {} has no channels", cfg.report.site_id);
    }

    if let Some(pool) = &pool {
        for c in db::channel_coverage(pool, &channel_ids, span.start).await? {
            tracing::info!(
                channel_id = c.channel_id,
                first_ts = ?c.first_ts,
                last_ts = ?c.last_ts,
                total_readings = c.total_readings,
                "store coverage"
            );
        }
    }

    let source = ConfiguredSource::from_config(&cfg, pool)?;
    let query = ReadingQuery {
        channel_ids: channel_ids.clone(),
        start: span.start,
        end: span.end,
    };
    let readings = collect_readings(&source, &query).await?;
    let groups = group_by_channel(&readings);
    let series = groups
        .iter()
        .map(|(id, rows)| ChannelSeries::new(*id, rows))
        .collect::<Result<Vec<_>, _>>()?;

    let report = analyze_sensor_health(&channel_ids, &series, &span, &cfg.analytics.sensor_health, offset);
    for ch in &report.channels {
        let name = channels
            .iter()
            .find(|c| c.channel_id == ch.channel_id)
            .map_or("unknown", |c| c.channel_name.as_str());
        tracing::info!(
            channel_id = ch.channel_id,
            channel_name = name,
            completeness_pct = format!("{:.1}", ch.completeness_pct),
            actual = ch.actual_readings,
            expected = ch.expected_readings,
            gaps = ch.gaps.len(),
            partial_days = ch.partial_days.len(),
            issues = ?ch.issues,
            "channel completeness"
        );
        for r in &ch.missing_days {
            tracing::warn!(
                channel_id = ch.channel_id,
                from = %r.start,
                to = %r.end,
                days = r.days,
                "missing days, backfill needed"
            );
        }
    }
    tracing::info!(
        channels = report.channels.len(),
        healthy = report.healthy_channels,
        with_issues = report.channels_with_issues,
        "sensor audit complete"
    );

    Ok(())
}
