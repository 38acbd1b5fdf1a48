//! CLI smoke entry point.
//!
//! # Responsibility
//! - Verify `encyclo_core` linkage with deterministic output.
//! - Optionally open a database and print article/quota statistics, logging
//!   to `LOG_DIR` when one is given.
//!
//! Usage: `encyclo_cli [DB_PATH [LOG_DIR]]`

use encyclo_core::db::open_db;
use encyclo_core::{
    core_version, default_log_level, init_logging, ArticleStore, Clock, QuotaTracker,
    SqliteArticleStore, SqliteQuotaTracker, SystemClock,
};
use log::info;
use std::error::Error;
use std::path::Path;
use std::process::ExitCode;

fn main() -> ExitCode {
    println!("encyclo_core version={}", core_version());

    let mut args = std::env::args().skip(1);
    let Some(db_path) = args.next() else {
        return ExitCode::SUCCESS;
    };
    let log_dir = args.next();

    match print_stats(&db_path, log_dir.as_deref()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn print_stats(db_path: &str, log_dir: Option<&str>) -> Result<(), Box<dyn Error>> {
    if let Some(log_dir) = log_dir {
        let log_dir = std::env::current_dir()?.join(Path::new(log_dir));
        init_logging(default_log_level(), &log_dir.to_string_lossy())?;
    }

    let conn = open_db(db_path)?;
    let articles = SqliteArticleStore::try_new(&conn)?;
    let quota = SqliteQuotaTracker::try_new(&conn)?;
    let today = SystemClock.today()?;
    let count = articles.count()?;
    let used = quota.usage(today)?;

    info!("event=cli_stats module=cli status=ok articles={count} quota_day={today} quota_used={used}");
    println!("articles={count}");
    println!("quota_day={today} quota_used={used}");
    Ok(())
}
