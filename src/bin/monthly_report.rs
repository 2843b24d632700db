//! Monthly regional KPI report.
//!
//! Pulls the previous calendar month's query results for one market,
//! reshapes them into a flat KPI table, writes a CSV artifact and optionally
//! uploads it to a Slack channel.
//!
//! Run: ./target/release/monthly_report --market sg --channel "#kpi-reports"
//!
//! Environment variables:
//!   REDASH_BASE_URL - base address of the query-execution service
//!   REDASH_API_KEY  - static API key attached to every request
//!   SLACK_TOKEN     - bot token, only needed when --channel is given

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use kpi_report::client::{Batch, ParamValue, QueryRequest, QueryRunner, RedashService};
use kpi_report::markets::Market;
use kpi_report::period;
use kpi_report::slack::SlackNotifier;
use kpi_report::table::safe_div;
use tracing::info;

// Query ids on the shared dashboarding service, all parameterized by the
// report month. The churn query deliberately runs from the trailing month
// so the report row has a previous-month baseline next to it.
const Q_TRIPS: u32 = 2183;
const Q_ACTIVE_RIDERS: u32 = 2187;
const Q_ONLINE_DRIVERS: u32 = 2203;
const Q_DRIVER_HOURS: u32 = 2208;
const Q_SEGMENTS: u32 = 2194;
const Q_RIDER_CHURN: u32 = 4724;
const Q_MATCHING: u32 = 4814;

#[derive(Parser)]
#[command(about = "Generate the monthly KPI report for one market")]
struct Args {
    /// Market code: SG, VN, KH, TH or HK
    #[arg(long)]
    market: String,

    /// Directory the CSV artifact is written to
    #[arg(long, default_value = "out")]
    out_dir: PathBuf,

    /// Slack channel to upload the artifact to; skipped when absent
    #[arg(long)]
    channel: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .init();

    let args = Args::parse();
    let market = Market::from_code(&args.market)
        .with_context(|| format!("unknown market code {:?}", args.market))?;

    let p = period::previous_month(Utc::now().date_naive());
    info!(market = %market, label = %p.label, "starting monthly report");

    let date = p.start.format("%Y-%m-%d").to_string();
    let requests = vec![
        QueryRequest::new(Q_TRIPS).param("date", date.as_str()),
        QueryRequest::new(Q_ACTIVE_RIDERS).param("date", date.as_str()),
        QueryRequest::new(Q_ONLINE_DRIVERS).param("date", date.as_str()),
        QueryRequest::new(Q_DRIVER_HOURS).param("date", date.as_str()),
        QueryRequest::new(Q_SEGMENTS).param("date", date.as_str()),
        QueryRequest::new(Q_RIDER_CHURN)
            .param("date", p.churn_start.format("%Y-%m-%d").to_string()),
        QueryRequest::new(Q_MATCHING)
            .param("region", market.region_id())
            .param(
                "Date Range",
                ParamValue::date_range(date.clone(), p.end.format("%Y-%m-%d").to_string()),
            ),
    ];

    let runner = QueryRunner::new(RedashService::from_env()?);
    let mut batch = Batch::new();
    runner.run_all(&mut batch, &requests).await;

    let trips = runner.fetch_result(&batch, Q_TRIPS).await;
    let riders = runner.fetch_result(&batch, Q_ACTIVE_RIDERS).await;
    let online = runner.fetch_result(&batch, Q_ONLINE_DRIVERS).await;
    let hours = runner.fetch_result(&batch, Q_DRIVER_HOURS).await;
    let segments = runner.fetch_result(&batch, Q_SEGMENTS).await;
    let churn = runner.fetch_result(&batch, Q_RIDER_CHURN).await;
    let matching = runner.fetch_result(&batch, Q_MATCHING).await;

    let days = Some(f64::from(p.days));
    let completed = trips.number("total_completed_trip");
    let active_riders = riders.number_in(&["active_users", "active_riders"]);
    let completed_riders = trips.number("rider_monthly_complete");

    let mut kpis: Vec<(String, Option<f64>)> = vec![
        ("Completed Trips".into(), completed),
        ("Completed Trips (Daily Average)".into(), safe_div(completed, days)),
        ("Monthly Active Riders".into(), active_riders),
        (
            "Completed Riders / MAU".into(),
            safe_div(completed_riders, active_riders),
        ),
        (
            "Daily Avg Online Drivers".into(),
            online.number_in(&["avg_online_drivers", "online_drivers"]),
        ),
        (
            "Average Driver Online Hours".into(),
            hours.number("avg_online_hours"),
        ),
        (
            "Median Time to Match (Seconds)".into(),
            matching.number_in(&["median_time_to_match_sec", "median_time_to_match"]),
        ),
    ];

    // Per-vehicle-type segment rows. The segment table's type column varies
    // by market, so resolution goes through the candidate list.
    for vt in ["2W", "4W"] {
        let row = segments.vehicle_type(vt, None);
        let bookings = row.number("total_booking");
        let seg_completed = row.number("total_completed");
        kpis.push((format!("{vt} Bookings Created"), bookings));
        kpis.push((format!("{vt} Completed Trips"), seg_completed));
        kpis.push((format!("{vt} Completion Rate"), safe_div(seg_completed, bookings)));
    }

    // Churn needs the report month's row plus the trailing month's active
    // base out of the same multi-month table.
    let report_row = churn.month_row(p.start);
    let baseline_row = churn.month_row(p.churn_start);
    let churned = report_row.number_in(&["churned_riders", "churned"]);
    let baseline_active = baseline_row.number_in(&["active_users", "active_riders"]);
    kpis.push(("Rider Churned".into(), churned));
    kpis.push(("Rider Churn Rate".into(), safe_div(churned, baseline_active)));

    std::fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("creating {}", args.out_dir.display()))?;
    let path = args
        .out_dir
        .join(format!("{}_KPI_{}.csv", market.code(), p.label));
    write_artifact(&path, &p.label, &kpis)?;
    info!(path = %path.display(), "artifact written");

    if let Some(channel) = &args.channel {
        let comment = format!("{} KPI report for {}", market.name(), p.label);
        SlackNotifier::from_env()?
            .upload_file(&path, channel, &comment)
            .await;
    }

    Ok(())
}

/// Missing values become empty cells, not zeros: a failed upstream query
/// must show up as a gap in the artifact.
fn write_artifact(path: &Path, label: &str, kpis: &[(String, Option<f64>)]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["KPI", label])?;
    for (name, value) in kpis {
        let cell = value.map(|v| v.to_string()).unwrap_or_default();
        writer.write_record([name.as_str(), cell.as_str()])?;
    }
    writer.flush()?;
    Ok(())
}
