//! history_report - export query history as JSON, a text report and CSV sheets

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use weapon_detect::history::{export_json, SqliteHistoryStore};
use weapon_detect::report::{render_text_report, write_csv_workbook, ReportData};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the history database.
    #[arg(long, env = "WEAPON_DB_PATH", default_value = "data/history.db")]
    db_path: String,
    /// Directory receiving the report files.
    #[arg(long, env = "WEAPON_OUTPUT_DIR", default_value = "outputs")]
    out_dir: PathBuf,
    /// Most recent queries included in the report and sheets.
    #[arg(long, default_value_t = 500)]
    limit: usize,
    /// UI mode for stderr progress
    #[arg(long, value_enum, default_value = "auto", value_name = "MODE")]
    ui: ui::UiMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = ui::Ui::new(args.ui);

    let store = {
        let stage = ui.stage("Open history");
        let store = SqliteHistoryStore::open(&args.db_path)?;
        stage.done();
        store
    };

    let json_path = {
        let stage = ui.stage("Export JSON");
        let path = export_json(&store, &args.out_dir.join("history_export.json"))?;
        stage.done();
        path
    };

    let data = ReportData::collect(&store, args.limit)?;
    let report_path = {
        let stage = ui.stage("Render text report");
        let name = format!("report_{}.txt", data.generated_at.format("%Y%m%d_%H%M%S"));
        let path = args.out_dir.join(name);
        std::fs::write(&path, render_text_report(&data))?;
        stage.done();
        path
    };

    let sheets = {
        let stage = ui.stage("Write CSV workbook");
        let dir = args
            .out_dir
            .join(format!("report_{}", data.generated_at.format("%Y%m%d_%H%M%S")));
        let sheets = write_csv_workbook(&data, &dir)?;
        stage.detail(&format!("{} sheets", sheets.len()));
        stage.done();
        sheets
    };

    println!("json export: {}", json_path.display());
    println!("text report: {}", report_path.display());
    for sheet in sheets {
        println!("csv sheet: {}", sheet.display());
    }
    Ok(())
}
