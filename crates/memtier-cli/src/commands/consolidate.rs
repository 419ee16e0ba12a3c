use clap::Parser;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use memtier::{ConsolidationMode, MemoryEngine};

use crate::error::CliResult;
use crate::output::OutputFormat;

#[derive(Parser)]
pub struct ConsolidateCommand {
    #[clap(
        long,
        short,
        default_value = "light",
        help = "Consolidation depth (light, deep, full)"
    )]
    pub mode: String,
}

impl ConsolidateCommand {
    pub async fn execute(&self, engine: &MemoryEngine, format: OutputFormat) -> CliResult<()> {
        let mode = ConsolidationMode::parse(&self.mode).ok_or_else(|| {
            format!("Unknown mode: {}. Use light, deep, or full.", self.mode)
        })?;

        let summary = engine.consolidate(mode).await?;
        let dead = if summary.failed_jobs.is_empty() {
            Vec::new()
        } else {
            engine.dead_letter_jobs().await
        };

        match format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
            OutputFormat::Table => {
                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(["Processed", "Merged", "Archived", "Promoted", "Decayed", "Reindexed"]);

                table.add_row([
                    summary.processed.to_string(),
                    summary.merged.to_string(),
                    summary.archived.to_string(),
                    summary.promoted.to_string(),
                    summary.decayed.to_string(),
                    summary.reindexed.to_string(),
                ]);

                println!("{table}");
                println!(
                    "\n{} pass finished in {} ms ({} jobs)",
                    summary.mode,
                    summary.duration_ms,
                    summary.job_ids.len()
                );

                for job in dead.iter().filter(|j| summary.failed_jobs.contains(&j.id)) {
                    println!(
                        "  dead: {} {} after {} retries: {}",
                        job.id,
                        job.job_type,
                        job.retry_count,
                        job.last_error.as_deref().unwrap_or("-")
                    );
                }
            }
        }

        Ok(())
    }
}
