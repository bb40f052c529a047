use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

use crate::tasks::RunOutcome;

/// Writes `summary.json` and `brief.md` under `<reports_dir>/<run_id>/` and returns that directory.
pub async fn write_run_report(reports_dir: &Path, outcome: &RunOutcome) -> Result<PathBuf> {
    let run_dir = reports_dir.join(outcome.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let summary_json =
        serde_json::to_vec_pretty(outcome).context("serializing run summary")?;
    fs::write(run_dir.join("summary.json"), summary_json)
        .await
        .context("writing summary.json")?;

    fs::write(run_dir.join("brief.md"), render_brief(outcome))
        .await
        .context("writing brief.md")?;

    Ok(run_dir)
}

fn render_brief(outcome: &RunOutcome) -> String {
    let s = &outcome.summary;
    let mut brief = format!(
        "# docmig {}\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Dry run: {}\n\n## Counts\n- Inserted: {}\n- Patched: {}\n- Deleted: {}\n- Skipped: {}\n- Unresolved: {}\n- Conflicts: {}\n- Ambiguous names: {}\n",
        outcome.mode,
        outcome.run_id,
        outcome.started_at,
        outcome.finished_at,
        outcome.dry_run,
        s.inserted,
        s.patched,
        s.deleted,
        s.skipped_errors,
        s.unresolved,
        s.conflicts,
        s.ambiguous
    );

    if let Some(reason) = &outcome.aborted {
        brief.push_str(&format!("\n**Aborted:** {reason}\n"));
    }
    section(&mut brief, "Notes", outcome.notes.iter().cloned());
    section(
        &mut brief,
        "Conflicts",
        outcome.conflicts.iter().map(|c| c.to_string()),
    );
    section(
        &mut brief,
        "Unresolved",
        outcome.unresolved.iter().map(|u| match &u.suggestion {
            Some(hint) => format!("{}: `{}` (did you mean `{}`?)", u.record_id, u.name, hint),
            None => format!("{}: `{}`", u.record_id, u.name),
        }),
    );
    section(
        &mut brief,
        "Ambiguous names",
        outcome
            .ambiguous
            .iter()
            .map(|(name, ids)| format!("`{}`: {}", name, ids.join(", "))),
    );
    section(
        &mut brief,
        "Duplicates",
        outcome.duplicates.iter().map(|g| {
            format!("`{}`: kept {}, removed {}", g.key, g.kept, g.removed.join(", "))
        }),
    );
    section(
        &mut brief,
        "Skipped",
        outcome
            .skipped
            .iter()
            .map(|op| format!("{} {}/{}: {}", op.op, op.collection, op.id, op.error)),
    );
    brief
}

fn section(brief: &mut String, title: &str, lines: impl Iterator<Item = String>) {
    let lines: Vec<String> = lines.map(|line| format!("- {line}")).collect();
    if lines.is_empty() {
        return;
    }
    brief.push_str(&format!("\n## {title}\n{}\n", lines.join("\n")));
}
