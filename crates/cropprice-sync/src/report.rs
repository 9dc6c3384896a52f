use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cropprice_core::RunLog;
use tokio::fs;

use crate::notify::Summary;

/// Write `run_summary.json` and `daily_brief.md` under `<reports_dir>/<run_id>/`.
pub async fn write_run_report(reports_dir: &Path, log: &RunLog, summary: &Summary) -> Result<PathBuf> {
    let run_dir = reports_dir.join(log.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(&serde_json::json!({
        "run": log,
        "saved": log.saved_count(),
        "email": summary,
    }))
    .context("serializing run summary")?;
    fs::write(run_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;

    fs::write(run_dir.join("daily_brief.md"), render_brief(log, summary))
        .await
        .context("writing daily_brief.md")?;

    Ok(run_dir)
}

fn render_brief(log: &RunLog, summary: &Summary) -> String {
    let finished = log
        .finished_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    let lines = log
        .outcomes
        .iter()
        .map(|o| format!("- [{}] {}", if o.success { "x" } else { " " }, o.message))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "# {}\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Saved: {} of {}\n\n## Pairs\n{}\n",
        summary.subject,
        log.run_id,
        log.started_at.to_rfc3339(),
        finished,
        log.saved_count(),
        log.outcomes.len(),
        lines
    )
}
