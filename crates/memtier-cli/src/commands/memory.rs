use clap::{Parser, Subcommand};
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use memtier::{ItemKind, MemoryEngine, MemoryFilter, MemoryItem, StoreRequest, Tier};

use crate::error::CliResult;
use crate::output::{OutputFormat, format_timestamp, parse_id, truncate_string};

#[derive(Parser)]
pub struct MemoryCommand {
    #[clap(subcommand)]
    pub command: MemorySubcommand,
}

#[derive(Subcommand)]
pub enum MemorySubcommand {
    #[clap(about = "Manually add a memory")]
    Add(AddArgs),

    #[clap(about = "Search memories")]
    Search(SearchArgs),

    #[clap(about = "Show memory details")]
    Show(ShowArgs),

    #[clap(about = "Delete a memory")]
    Delete(DeleteArgs),
}

#[derive(Parser)]
pub struct AddArgs {
    #[clap(help = "Memory content text")]
    pub text: String,

    #[clap(long, short, help = "Importance hint in [0, 1]")]
    pub importance: Option<f32>,

    #[clap(long = "tag", short, help = "Tag to attach (repeatable)")]
    pub tags: Vec<String>,

    #[clap(long, help = "Category label")]
    pub category: Option<String>,

    #[clap(long, help = "Store as a learned skill with this name", conflicts_with = "consensus")]
    pub skill: Option<String>,

    #[clap(long, help = "Store as a consensus record with this agreement score")]
    pub consensus: Option<f32>,
}

#[derive(Parser)]
pub struct SearchArgs {
    #[clap(help = "Query text")]
    pub query: String,

    #[clap(long, short, help = "Maximum number of results")]
    pub limit: Option<usize>,

    #[clap(long = "tag", short, help = "Require this tag (repeatable)")]
    pub tags: Vec<String>,

    #[clap(long, help = "Filter by category")]
    pub category: Option<String>,

    #[clap(long, help = "Filter by tier (working, short_term, long_term)")]
    pub tier: Option<String>,
}

#[derive(Parser)]
pub struct ShowArgs {
    #[clap(help = "Memory ID (UUID format)")]
    pub id: String,

    #[clap(long, help = "Include the audit history")]
    pub history: bool,
}

#[derive(Parser)]
pub struct DeleteArgs {
    #[clap(help = "Memory ID to delete (UUID format)")]
    pub id: String,

    #[clap(long, default_value = "deleted from cli", help = "Reason recorded in the audit log")]
    pub reason: String,
}

impl MemoryCommand {
    pub async fn execute(&self, engine: &MemoryEngine, format: OutputFormat) -> CliResult<()> {
        match &self.command {
            MemorySubcommand::Add(args) => Self::add(engine, args, format).await,
            MemorySubcommand::Search(args) => Self::search(engine, args, format).await,
            MemorySubcommand::Show(args) => Self::show(engine, args, format).await,
            MemorySubcommand::Delete(args) => Self::delete(engine, args, format).await,
        }
    }

    async fn add(engine: &MemoryEngine, args: &AddArgs, format: OutputFormat) -> CliResult<()> {
        let mut request = StoreRequest::new(&args.text).with_tags(args.tags.iter().cloned());
        if let Some(importance) = args.importance {
            request = request.with_importance(importance);
        }
        if let Some(ref category) = args.category {
            request = request.with_category(category);
        }
        request = request.with_kind(item_kind(args));

        let outcome = engine.store(request).await?;

        match format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "id": outcome.id.to_string(),
                    "deduplicated": outcome.deduplicated,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => {
                if outcome.deduplicated {
                    println!("Content matched existing memory {}; merged into it.", outcome.id);
                } else {
                    println!("Memory {} added.", outcome.id);
                }
            }
        }

        Ok(())
    }

    async fn search(engine: &MemoryEngine, args: &SearchArgs, format: OutputFormat) -> CliResult<()> {
        let mut filter = MemoryFilter::new();
        if !args.tags.is_empty() {
            filter = filter.with_tags(args.tags.iter().cloned());
        }
        if let Some(ref category) = args.category {
            filter = filter.with_category(category);
        }
        if let Some(ref tier) = args.tier {
            let tier = Tier::parse(tier).ok_or_else(|| {
                format!("Unknown tier: {tier}. Use working, short_term, or long_term.")
            })?;
            filter = filter.with_tiers(vec![tier]);
        }

        let results = engine.retrieve(&args.query, args.limit, &filter).await?;

        match format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&results)?);
            }
            OutputFormat::Table => {
                if results.is_empty() {
                    println!("No memories found.");
                    return Ok(());
                }

                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(["ID", "Content", "Score", "Similarity", "Tier", "Source"]);

                for result in &results {
                    table.add_row([
                        truncate_string(&result.item.id.to_string(), 8),
                        truncate_string(&result.item.content, 50),
                        format!("{:.3}", result.score),
                        format!("{:.3}", result.signals.similarity),
                        result.item.tier.to_string(),
                        result.source.to_string(),
                    ]);
                }

                println!("{table}");
                println!("\nTotal: {} results", results.len());
            }
        }

        Ok(())
    }

    async fn show(engine: &MemoryEngine, args: &ShowArgs, format: OutputFormat) -> CliResult<()> {
        let id = parse_id(&args.id)?;

        let item = engine
            .get(id)
            .await?
            .ok_or_else(|| format!("Memory not found: {}", args.id))?;
        let history = if args.history {
            engine.history(id).await?
        } else {
            Vec::new()
        };

        match format {
            OutputFormat::Json => {
                let mut output = serde_json::to_value(&item)?;
                if let Some(fields) = output.as_object_mut() {
                    fields.remove("embedding");
                    fields.insert("embedding_size".into(), item.embedding.len().into());
                    if args.history {
                        fields.insert("history".into(), serde_json::to_value(&history)?);
                    }
                }
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => {
                println!("{}", detail_table(&item));

                if args.history {
                    let mut table = Table::new();
                    table
                        .load_preset(UTF8_FULL_CONDENSED)
                        .set_content_arrangement(ContentArrangement::Dynamic)
                        .set_header(["When", "Action", "Actor", "Reason"]);
                    for event in &history {
                        table.add_row([
                            format_timestamp(&event.timestamp),
                            format!("{:?}", event.action),
                            event.actor.clone(),
                            truncate_string(&event.reason, 60),
                        ]);
                    }
                    println!("\n{table}");
                }
            }
        }

        Ok(())
    }

    async fn delete(engine: &MemoryEngine, args: &DeleteArgs, format: OutputFormat) -> CliResult<()> {
        let id = parse_id(&args.id)?;

        let deleted = engine.delete(id, &args.reason).await?;

        match format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "id": args.id,
                    "deleted": deleted,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => {
                if deleted {
                    println!("Memory {} deleted successfully.", args.id);
                } else {
                    println!("Memory {} not found.", args.id);
                }
            }
        }

        Ok(())
    }
}

fn item_kind(args: &AddArgs) -> ItemKind {
    match (&args.skill, args.consensus) {
        (Some(name), _) => ItemKind::Skill { name: name.clone() },
        (None, Some(consensus_score)) => ItemKind::Consensus { consensus_score },
        (None, None) => ItemKind::Memory,
    }
}

fn kind_label(kind: &ItemKind) -> String {
    match kind {
        ItemKind::Memory => "memory".to_string(),
        ItemKind::Skill { name } => format!("skill ({name})"),
        ItemKind::Consensus { consensus_score } => format!("consensus ({consensus_score:.2})"),
    }
}

fn detail_table(item: &MemoryItem) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(["Property", "Value"]);

    table.add_row(["ID", &item.id.to_string()]);
    table.add_row(["Content", &item.content]);
    table.add_row(["Kind", &kind_label(&item.kind)]);
    table.add_row(["Tier", item.tier.as_str()]);
    table.add_row(["Importance", &format!("{:.4}", item.importance)]);
    table.add_row(["Decay Score", &format!("{:.4}", item.decay_score)]);
    table.add_row(["Verification", &format!("{:.2}", item.verification_score)]);
    table.add_row(["Tags", &item.tags.iter().cloned().collect::<Vec<_>>().join(", ")]);
    table.add_row(["Category", item.category.as_deref().unwrap_or("-")]);
    table.add_row(["Entities", &item.entities.join(", ")]);
    table.add_row(["Created", &item.created_at.to_rfc3339()]);
    table.add_row(["Last Accessed", &item.accessed_at.to_rfc3339()]);
    table.add_row(["Access Count", &item.access_count.to_string()]);
    table.add_row(["Archived", if item.is_archived { "yes" } else { "no" }]);
    if let Some(merged_into) = item.merged_into {
        table.add_row(["Merged Into", &merged_into.to_string()]);
    }
    if !item.merged_from.is_empty() {
        let sources: Vec<String> = item.merged_from.iter().map(|id| id.to_string()).collect();
        table.add_row(["Merged From", &sources.join(", ")]);
    }
    table.add_row(["Embedding Size", &item.embedding.len().to_string()]);
    table
}
