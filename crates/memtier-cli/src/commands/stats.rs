use clap::Parser;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use memtier::cache::LevelStats;
use memtier::{MemoryEngine, Tier};

use crate::error::CliResult;
use crate::output::OutputFormat;

#[derive(Parser)]
pub struct StatsCommand {}

impl StatsCommand {
    pub async fn execute(&self, engine: &MemoryEngine, format: OutputFormat) -> CliResult<()> {
        let stats = engine.stats().await?;

        match format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
            OutputFormat::Table => {
                println!("Memtier Statistics");
                println!("==================\n");

                let mut tiers = Table::new();
                tiers
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(["Tier", "Active Items"]);
                for tier in Tier::ALL {
                    let count = stats.store.by_tier.get(&tier).copied().unwrap_or(0);
                    tiers.add_row([tier.to_string(), count.to_string()]);
                }
                println!("{tiers}\n");

                println!(
                    "Total: {} items ({} active, {} archived)\n",
                    stats.store.total, stats.store.active, stats.store.archived
                );

                let mut cache = Table::new();
                cache
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(["Cache", "Entries", "Hits", "Misses", "Hit Rate"]);
                for (name, level) in [
                    ("L1", &stats.cache.l1),
                    ("L2", &stats.cache.l2),
                    ("L3", &stats.cache.l3),
                ] {
                    cache.add_row(level_row(name, level));
                }
                println!("{cache}\n");

                println!(
                    "Jobs: {} queued, {} running, {} completed, {} failed, {} dead",
                    stats.jobs.queued,
                    stats.jobs.running,
                    stats.jobs.completed,
                    stats.jobs.failed,
                    stats.jobs.dead
                );
            }
        }

        Ok(())
    }
}

fn level_row(name: &str, level: &LevelStats) -> [String; 5] {
    [
        name.to_string(),
        level.entries.to_string(),
        level.hits.to_string(),
        level.misses.to_string(),
        format!("{:.1}%", level.hit_rate() * 100.0),
    ]
}
