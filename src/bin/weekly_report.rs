//! Weekly KPI report.
//!
//! Covers the previous Monday-to-Sunday week in the market's local time.
//! Same shape as the monthly report with a smaller query set.
//!
//! Run: ./target/release/weekly_report --market hk

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use kpi_report::client::{Batch, QueryRequest, QueryRunner, RedashService};
use kpi_report::markets::Market;
use kpi_report::period;
use kpi_report::slack::SlackNotifier;
use kpi_report::table::safe_div;
use tracing::info;

// Weekly query ids, parameterized by the week's Monday.
const Q_TRIPS: u32 = 4620;
const Q_ACTIVE_RIDERS: u32 = 4621;
const Q_ONLINE_DRIVERS: u32 = 4632;
const Q_AVERAGE_FARE: u32 = 4633;

#[derive(Parser)]
#[command(about = "Generate the weekly KPI report for one market")]
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

    let week = period::previous_week(Utc::now(), market.utc_offset_hours());
    info!(market = %market, week_start = %week.start, "starting weekly report");

    let week_start = week.start.format("%Y-%m-%d").to_string();
    let requests: Vec<QueryRequest> = [Q_TRIPS, Q_ACTIVE_RIDERS, Q_ONLINE_DRIVERS, Q_AVERAGE_FARE]
        .iter()
        .map(|id| QueryRequest::new(*id).param("week_start_date", week_start.as_str()))
        .collect();

    let runner = QueryRunner::new(RedashService::from_env()?);
    let mut batch = Batch::new();
    runner.run_all(&mut batch, &requests).await;

    let trips = runner.fetch_result(&batch, Q_TRIPS).await;
    let riders = runner.fetch_result(&batch, Q_ACTIVE_RIDERS).await;
    let online = runner.fetch_result(&batch, Q_ONLINE_DRIVERS).await;
    let fares = runner.fetch_result(&batch, Q_AVERAGE_FARE).await;

    let completed = trips.number("total_completed_trip");
    let active = riders.number_in(&["active_users", "active_riders"]);
    let completed_riders = trips.number("rider_weekly_complete");

    let kpis: Vec<(String, Option<f64>)> = vec![
        ("Completed Trips".into(), completed),
        ("Completed Trips (Daily Average)".into(), trips.number("daily_completed_trip")),
        ("Weekly Active Riders".into(), active),
        ("Completed Riders / WAU".into(), safe_div(completed_riders, active)),
        (
            "Daily Avg Online Drivers".into(),
            online.number_in(&["avg_online_drivers", "online_drivers"]),
        ),
        ("Average Fare".into(), fares.number_in(&["avg_fare", "average_fare"])),
    ];

    std::fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("creating {}", args.out_dir.display()))?;
    let path = args
        .out_dir
        .join(format!("{}_Weekly_{}.csv", market.code(), week.label));
    write_artifact(&path, &week.label, &kpis)?;
    info!(path = %path.display(), "artifact written");

    if let Some(channel) = &args.channel {
        let comment = format!("{} weekly report for week of {}", market.name(), week.label);
        SlackNotifier::from_env()?
            .upload_file(&path, channel, &comment)
            .await;
    }

    Ok(())
}

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
