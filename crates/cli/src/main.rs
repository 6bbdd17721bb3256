//! branchbase command-line administration tool.
//!
//! Operates directly on the daemon's database through the same engine the
//! HTTP API uses: list and manage branches, preview and run merges, revert
//! merges, inspect entity history, and generate / validate configuration.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use branchbase_core::branches::NewBranch;
use branchbase_core::config::AppConfig;
use branchbase_core::db::Database;
use branchbase_core::engine::Engine;
use branchbase_core::errors::{ConflictError, EngineError};
use branchbase_core::history::HistoryQuery;
use branchbase_core::merge::MergeRequest;
use branchbase_core::models::{
    Branch, ConflictResolution, EntityType, MergeConflict, MergeStrategy, RollbackStrategy,
};
use branchbase_core::rollback::{DirectRollback, RollbackRequest};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// branchbase command-line administration tool.
#[derive(Parser, Debug)]
#[command(
    name = "branchbase",
    version,
    about = "Manage branches, merges and rollbacks of a branchbase store"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(
        short,
        long,
        global = true,
        default_value = "/etc/branchbase/config.toml"
    )]
    config: PathBuf,

    /// Tenant to operate on (defaults to `engine.default_tenant`).
    #[arg(long, global = true)]
    tenant: Option<String>,

    /// Print results as JSON instead of tables.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage branches.
    Branches {
        #[command(subcommand)]
        action: BranchAction,
    },

    /// Show what merging SOURCE into TARGET would do.
    Preview {
        /// Source branch (id or name).
        source: String,
        /// Target branch (id or name).
        target: String,
    },

    /// Merge SOURCE into TARGET.
    Merge {
        /// Source branch (id or name).
        source: String,
        /// Target branch (id or name).
        target: String,

        /// AUTO, FAST_FORWARD, THREE_WAY, SQUASH or SELECTIVE.
        #[arg(long, default_value = "AUTO")]
        strategy: String,

        /// ABORT_ON_CONFLICT, FAVOR_SOURCE or FAVOR_TARGET.
        #[arg(long, default_value = "ABORT_ON_CONFLICT")]
        resolution: String,

        /// Entity ids to merge (SELECTIVE only).
        #[arg(long = "entity", value_name = "ID")]
        entities: Vec<String>,

        #[arg(short, long)]
        message: Option<String>,

        #[arg(long, default_value = "cli")]
        author: String,
    },

    /// Revert merges.
    Rollback {
        #[command(subcommand)]
        action: RollbackAction,
    },

    /// Show the change history of one entity on a branch.
    History {
        /// Entity type or resource key (`Rule`, `rules`, ...).
        entity_type: String,
        entity_id: String,

        /// Branch (id or name); defaults to the tenant's default branch.
        #[arg(short, long)]
        branch: Option<String>,

        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./branchbase.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,
}

#[derive(Subcommand, Debug)]
enum BranchAction {
    /// List the tenant's branches.
    List,
    /// Create a branch.
    Create {
        name: String,

        /// Parent branch (id or name); defaults to the default branch.
        #[arg(short, long)]
        parent: Option<String>,

        #[arg(short, long)]
        description: Option<String>,

        #[arg(long, default_value = "cli")]
        author: String,
    },
    /// Lock a branch against edits.
    Lock { branch: String },
    /// Unlock a branch.
    Unlock { branch: String },
    /// Delete a branch without unmerged edits.
    Delete { branch: String },
}

#[derive(Subcommand, Debug)]
enum RollbackAction {
    /// List recent merges into a branch and whether they can be reverted.
    Candidates {
        branch: String,

        #[arg(short, long, default_value = "20")]
        limit: u32,
    },
    /// Revert a whole merge.
    Merge {
        merge_event_id: String,

        /// CREATE_REVERT_COMMIT, RESTORE_TO_POINT or DIRECT_ROLLBACK.
        #[arg(long, default_value = "CREATE_REVERT_COMMIT")]
        strategy: String,

        /// Required for DIRECT_ROLLBACK, which deletes history.
        #[arg(long)]
        confirm_irreversible: bool,

        #[arg(short, long)]
        message: Option<String>,

        #[arg(long, default_value = "cli")]
        author: String,
    },
    /// Revert selected entities of a merge.
    Selective {
        merge_event_id: String,

        #[arg(long = "entity", value_name = "ID", required = true)]
        entities: Vec<String>,

        #[arg(short, long)]
        message: Option<String>,

        #[arg(long, default_value = "cli")]
        author: String,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    // Minimal logging for CLI
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("warn"))
        .with_target(false)
        .without_time()
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::Init { output } => return cmd_init(output),
        Commands::Validate => return cmd_validate(&cli.config),
        _ => {}
    }

    let config = AppConfig::load_and_validate(&cli.config)
        .context("failed to load configuration file")?;
    let ctx = Ctx {
        engine: open_engine(&config)?,
        tenant: cli.tenant,
        json: cli.json,
    };

    let result = match cli.command {
        Commands::Branches { action } => cmd_branches(&ctx, action).await,
        Commands::Preview { source, target } => cmd_preview(&ctx, &source, &target).await,
        Commands::Merge {
            source,
            target,
            strategy,
            resolution,
            entities,
            message,
            author,
        } => {
            let strategy = MergeStrategy::parse(&strategy)
                .ok_or_else(|| anyhow::anyhow!("unknown merge strategy '{}'", strategy))?;
            let resolution = ConflictResolution::parse(&resolution)
                .ok_or_else(|| anyhow::anyhow!("unknown conflict resolution '{}'", resolution))?;
            let request = MergeRequest {
                source_branch_id: ctx.branch(&source).await?.id,
                target_branch_id: ctx.branch(&target).await?.id,
                strategy,
                conflict_resolution: resolution,
                message,
                author_id: author,
                selected_entity_ids: entities,
                resolutions: Vec::new(),
            };
            cmd_merge(&ctx, request).await
        }
        Commands::Rollback { action } => cmd_rollback(&ctx, action).await,
        Commands::History {
            entity_type,
            entity_id,
            branch,
            limit,
        } => cmd_history(&ctx, &entity_type, entity_id, branch.as_deref(), limit).await,
        Commands::Init { .. } | Commands::Validate => Ok(()),
    };
    if let Err(e) = &result {
        print_details(e);
    }
    result
}

/// State shared by commands that touch the database.
struct Ctx {
    engine: Engine,
    tenant: Option<String>,
    json: bool,
}

impl Ctx {
    /// Find a branch by id or by name within the tenant.
    async fn branch(&self, key: &str) -> Result<Branch> {
        let branches = self.engine.list_branches(self.tenant.as_deref()).await?;
        branches
            .into_iter()
            .find(|b| b.id == key || b.name == key)
            .ok_or_else(|| anyhow::anyhow!("branch '{}' not found", key))
    }

    async fn default_branch(&self) -> Result<Branch> {
        Ok(self.engine.ensure_tenant(self.tenant.as_deref()).await?)
    }

    fn print_json<T: serde::Serialize>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

fn open_engine(config: &AppConfig) -> Result<Engine> {
    let db_path = config.daemon.database_path();
    debug!(path = %db_path.display(), "opening database");
    let db = Database::open(&db_path).context("failed to open database")?;
    Ok(Engine::new(Arc::new(db), config.engine.clone()))
}

/// Print the per-entity conflicts or rollback blockers behind an error.
fn print_details(e: &anyhow::Error) {
    let details: Vec<String> = match e.downcast_ref::<EngineError>() {
        Some(EngineError::Conflict(ConflictError::Conflicts { conflicts }))
        | Some(EngineError::Conflict(ConflictError::Unresolved { conflicts, .. })) => {
            conflicts.iter().map(describe_conflict).collect()
        }
        Some(EngineError::BlockedRollback { blockers }) => {
            blockers.iter().map(|b| b.message.clone()).collect()
        }
        _ => return,
    };
    for line in details {
        eprintln!("  - {line}");
    }
}

fn describe_conflict(c: &MergeConflict) -> String {
    let fields: Vec<&str> = c.fields.iter().map(|f| f.field.as_str()).collect();
    format!(
        "{} {} ({}): {}",
        c.entity_type,
        c.entity_id,
        c.conflict_type.as_str(),
        if fields.is_empty() {
            "whole entity".to_string()
        } else {
            fields.join(", ")
        }
    )
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

async fn cmd_branches(ctx: &Ctx, action: BranchAction) -> Result<()> {
    match action {
        BranchAction::List => {
            let branches = ctx.engine.list_branches(ctx.tenant.as_deref()).await?;
            if ctx.json {
                return ctx.print_json(&branches);
            }

            let names: std::collections::HashMap<&str, &str> = branches
                .iter()
                .map(|b| (b.id.as_str(), b.name.as_str()))
                .collect();

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_content_arrangement(ContentArrangement::Dynamic);
            table.set_header(vec!["Name", "Parent", "Changes", "Last activity", "State", "ID"]);
            for b in &branches {
                let parent = b
                    .parent_branch_id
                    .as_deref()
                    .and_then(|p| names.get(p).copied())
                    .unwrap_or("—");
                let state = if b.is_locked {
                    Cell::new("locked").fg(Color::Red)
                } else if b.is_default {
                    Cell::new("default").fg(Color::Green)
                } else {
                    Cell::new("open")
                };
                table.add_row(vec![
                    Cell::new(&b.name),
                    Cell::new(parent),
                    Cell::new(b.change_count),
                    Cell::new(b.last_activity_at.map(timestamp).unwrap_or_else(|| "—".into())),
                    state,
                    Cell::new(&b.id),
                ]);
            }
            println!("{table}");
            Ok(())
        }

        BranchAction::Create {
            name,
            parent,
            description,
            author,
        } => {
            let parent_branch_id = match parent {
                Some(key) => Some(ctx.branch(&key).await?.id),
                None => None,
            };
            let branch = ctx
                .engine
                .create_branch(
                    ctx.tenant.as_deref(),
                    &author,
                    NewBranch {
                        name,
                        description,
                        parent_branch_id,
                        ..NewBranch::default()
                    },
                )
                .await?;
            if ctx.json {
                return ctx.print_json(&branch);
            }
            println!("Created branch '{}' ({})", branch.name, branch.id);
            Ok(())
        }

        BranchAction::Lock { branch } => {
            let branch = ctx.engine.lock_branch(&ctx.branch(&branch).await?.id).await?;
            println!("Branch '{}' locked", branch.name);
            Ok(())
        }

        BranchAction::Unlock { branch } => {
            let branch = ctx.engine.unlock_branch(&ctx.branch(&branch).await?.id).await?;
            println!("Branch '{}' unlocked", branch.name);
            Ok(())
        }

        BranchAction::Delete { branch } => {
            let branch = ctx.branch(&branch).await?;
            ctx.engine.delete_branch(&branch.id).await?;
            println!("Branch '{}' deleted", branch.name);
            Ok(())
        }
    }
}

async fn cmd_preview(ctx: &Ctx, source: &str, target: &str) -> Result<()> {
    let (source, target) = (ctx.branch(source).await?, ctx.branch(target).await?);
    let preview = ctx.engine.merge_preview(&source.id, &target.id).await?;
    if ctx.json {
        return ctx.print_json(&preview);
    }

    println!("Merge preview: {} -> {}", source.name, target.name);
    println!();
    println!("  Added        : {}", preview.added_count);
    println!("  Modified     : {}", preview.modified_count);
    println!("  Deleted      : {}", preview.deleted_count);
    println!("  Conflicts    : {}", preview.conflicts.len());
    println!(
        "  Fast-forward : {}",
        if preview.can_fast_forward { "yes" } else { "no" }
    );
    println!();

    if preview.affected_entities.is_empty() {
        println!("Nothing to merge.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Type", "ID", "Name", "Change", "Conflict"]);
    for e in &preview.affected_entities {
        let conflict = match e.conflict_type {
            Some(kind) if e.conflicting_fields.is_empty() => {
                Cell::new(kind.as_str()).fg(Color::Red)
            }
            Some(kind) => Cell::new(format!("{} ({})", kind.as_str(), e.conflicting_fields.join(", ")))
                .fg(Color::Red),
            None => Cell::new("—"),
        };
        table.add_row(vec![
            Cell::new(e.entity_type),
            Cell::new(&e.entity_id),
            Cell::new(e.entity_name.as_deref().unwrap_or("—")),
            Cell::new(e.change_type.as_str()),
            conflict,
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn cmd_merge(ctx: &Ctx, request: MergeRequest) -> Result<()> {
    let event = ctx.engine.merge(request).await?;
    if ctx.json {
        return ctx.print_json(&event);
    }
    println!(
        "Merged with {} ({}): {} entit(y/ies) affected",
        event.strategy.as_str(),
        if event.fast_forward { "fast-forward" } else { "new records" },
        event.affected_entities.len()
    );
    println!("  Merge event : {}", event.id);
    println!("  Message     : {}", event.message);
    Ok(())
}

async fn cmd_rollback(ctx: &Ctx, action: RollbackAction) -> Result<()> {
    let result = match action {
        RollbackAction::Candidates { branch, limit } => {
            let branch = ctx.branch(&branch).await?;
            let candidates = ctx.engine.rollback_candidates(&branch.id, limit).await?;
            if ctx.json {
                return ctx.print_json(&candidates);
            }
            if candidates.is_empty() {
                println!("No merges into '{}' found.", branch.name);
                return Ok(());
            }

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_content_arrangement(ContentArrangement::Dynamic);
            table.set_header(vec!["Merged at", "Strategy", "Entities", "Revertible", "Message", "ID"]);
            for c in &candidates {
                let revertible = if c.can_revert {
                    Cell::new("yes").fg(Color::Green)
                } else if !c.blockers.is_empty() {
                    Cell::new(format!("blocked ({})", c.blockers.len())).fg(Color::Red)
                } else {
                    Cell::new("reverted").fg(Color::Yellow)
                };
                table.add_row(vec![
                    Cell::new(timestamp(c.merge_event.created_at)),
                    Cell::new(c.merge_event.strategy.as_str()),
                    Cell::new(c.merge_event.affected_entities.len()),
                    revertible,
                    Cell::new(&c.merge_event.message),
                    Cell::new(&c.merge_event.id),
                ]);
            }
            println!("{table}");
            return Ok(());
        }

        RollbackAction::Merge {
            merge_event_id,
            strategy,
            confirm_irreversible,
            message,
            author,
        } => {
            let strategy = RollbackStrategy::parse(&strategy)
                .ok_or_else(|| anyhow::anyhow!("unknown rollback strategy '{}'", strategy))?;
            if strategy == RollbackStrategy::DirectRollback {
                ctx.engine
                    .direct_rollback(DirectRollback {
                        merge_event_id,
                        entity_ids: Vec::new(),
                        message,
                        author_id: author,
                        confirm_irreversible,
                    })
                    .await?
            } else {
                ctx.engine
                    .rollback(RollbackRequest {
                        merge_event_id,
                        strategy,
                        message,
                        author_id: author,
                        ..RollbackRequest::default()
                    })
                    .await?
            }
        }

        RollbackAction::Selective {
            merge_event_id,
            entities,
            message,
            author,
        } => {
            ctx.engine
                .rollback(RollbackRequest {
                    merge_event_id,
                    strategy: RollbackStrategy::SelectiveRevert,
                    entity_ids: entities,
                    message,
                    author_id: author,
                    confirm_irreversible: false,
                })
                .await?
        }
    };

    if ctx.json {
        return ctx.print_json(&result);
    }
    println!(
        "Rollback {} ({}): reverted {}",
        result.id,
        result.strategy.as_str(),
        if result.reverted_entity_ids.is_empty() {
            "nothing".to_string()
        } else {
            result.reverted_entity_ids.join(", ")
        }
    );
    if !result.skipped_entity_ids.is_empty() {
        println!("  Already at target: {}", result.skipped_entity_ids.join(", "));
    }
    if result.forced {
        println!("  Forced past {} later change(s):", result.blockers.len());
        for b in &result.blockers {
            println!("    - {}", b.message);
        }
    }
    Ok(())
}

async fn cmd_history(
    ctx: &Ctx,
    entity_type: &str,
    entity_id: String,
    branch: Option<&str>,
    limit: Option<usize>,
) -> Result<()> {
    let entity_type = EntityType::parse(entity_type)
        .ok_or_else(|| anyhow::anyhow!("unknown entity type '{}'", entity_type))?;
    let branch = match branch {
        Some(key) => ctx.branch(key).await?,
        None => ctx.default_branch().await?,
    };
    let history = ctx
        .engine
        .history(HistoryQuery {
            entity_type,
            entity_id,
            branch_id: branch.id.clone(),
            include_field_changes: true,
            include_content: ctx.json,
            limit,
        })
        .await?;
    if ctx.json {
        return ctx.print_json(&history);
    }
    if history.is_empty() {
        println!("No history on '{}'.", branch.name);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["When", "Change", "Author", "Branch", "Fields", "SHA"]);
    for view in &history {
        let r = &view.record;
        let fields: Vec<String> = r
            .field_changes
            .iter()
            .map(|(field, change)| match &change.to {
                Some(to) => format!("{field}={to}"),
                None => format!("-{field}"),
            })
            .collect();
        let branch_cell = Cell::new(view.branch_name.as_deref().unwrap_or(&r.branch_id));
        table.add_row(vec![
            Cell::new(timestamp(r.created_at)),
            Cell::new(r.change_type.as_str()),
            Cell::new(view.author_name.as_deref().unwrap_or(&r.author_id)),
            if view.inherited {
                branch_cell.fg(Color::DarkGrey)
            } else {
                branch_cell
            },
            Cell::new(truncate(&fields.join(" "), 60)),
            Cell::new(&r.sha[..r.sha.len().min(12)]),
        ]);
    }
    println!("{table}");
    Ok(())
}

fn cmd_init(output: &Path) -> Result<()> {
    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    let rendered = AppConfig::default()
        .to_toml()
        .context("failed to render default configuration")?;
    let contents = format!("# branchbase configuration\n\n{rendered}");
    std::fs::write(output, contents).context("failed to write config file")?;

    println!("Default configuration written to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Adjust data_dir and the listen address");
    println!(
        "  2. Validate with: branchbase validate --config {}",
        output.display()
    );
    println!(
        "  3. Start the daemon: branchbase-daemon --config {}",
        output.display()
    );

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let config = AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    match config.validate() {
        Ok(()) => {
            println!("  [OK] All values are valid");
        }
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    println!();
    println!("Configuration summary:");
    println!("  Web listen       : {}", config.web.listen);
    println!("  Database         : {}", config.daemon.database_path().display());
    println!("  Default tenant   : {}", config.engine.default_tenant);
    println!("  Default branch   : {}", config.engine.default_branch_name);
    println!("  Merge lock wait  : {}ms", config.engine.merge_lock_timeout_ms);
    println!("  Operation limit  : {}ms", config.engine.operation_timeout_ms);
    println!(
        "  Batch auto-flush : {}",
        match config.batch.auto_flush_interval() {
            Some(every) => format!("every {}s", every.as_secs()),
            None => "disabled".to_string(),
        }
    );
    println!();
    println!("Configuration is valid.");

    Ok(())
}

// ---------------------------------------------------------------------------
// Utilities
// ---------------------------------------------------------------------------

fn timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
