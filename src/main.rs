//! colonel CLI: inspect skills, dry-run the policy, query the audit log.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use colonel::audit::{AuditFilter, AuditOutcome, AuditStore, JsonlAuditStore};
use colonel::config::{ColonelConfig, DEFAULT_CONFIG_FILE};
use colonel::policy::{PolicyEngine, PolicyVerdict};
use colonel::skills::capability::CapabilityBindings;
use colonel::skills::{BoundParams, Registry};

#[derive(Parser)]
#[command(name = "colonel", version, about = "Agent command-execution core")]
struct Cli {
    /// Config file (defaults to $COLONEL_CONFIG, then ./colonel.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or inspect the configuration file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Inspect skill definitions.
    Skills {
        #[command(subcommand)]
        action: SkillsAction,
    },

    /// List configured models and their trust tier.
    Models,

    /// Dry-run the capability policy.
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },

    /// Query an audit log.
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a default config file. Refuses to overwrite.
    Init {
        /// Target path (defaults to --config, then ./colonel.toml).
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Print the effective configuration.
    Show,
}

#[derive(Subcommand)]
enum SkillsAction {
    /// List loaded skills and actions.
    List,
    /// Validate every definition in a directory.
    Check {
        /// Directory containing *.skill.md / *.skill.toml files.
        dir: PathBuf,
    },
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Evaluate a proposed action without running it.
    Eval {
        /// Skill name.
        #[arg(long)]
        skill: String,
        /// Action name.
        #[arg(long)]
        action: String,
        /// Model id (defaults to the configured default model).
        #[arg(long)]
        model: Option<String>,
        /// Parameters as a JSON object.
        #[arg(long, default_value = "{}")]
        params: String,
    },
}

#[derive(Subcommand)]
enum AuditAction {
    /// Print matching entries, newest first.
    Query {
        /// JSONL audit log (defaults to `audit.path` from the config).
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long)]
        skill: Option<String>,
        #[arg(long)]
        action: Option<String>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        session: Option<String>,
        /// success, failure, timeout, cancelled, validation_failed, denied,
        /// rejected, expired, stale or superseded.
        #[arg(long)]
        outcome: Option<String>,
        #[arg(long, default_value = "50")]
        limit: usize,
        /// Print raw JSON lines.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // `config init` must work before any config exists.
    if let Commands::Config {
        action: ConfigAction::Init { path },
    } = &cli.command
    {
        let path = path
            .clone()
            .or_else(|| cli.config.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        ColonelConfig::default().write_new(&path)?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    let config = ColonelConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Init { .. } => {}
            ConfigAction::Show => print!("{}", config.to_toml()?),
        },

        Commands::Skills { action } => match action {
            SkillsAction::List => {
                let registry = load_registry(&config)?;
                print_registry(&registry);
            }
            SkillsAction::Check { dir } => {
                let registry = Registry::from_dirs(&[dir.clone()], &CapabilityBindings::new())?;
                println!(
                    "{}: {} skills, {} actions OK",
                    dir.display(),
                    registry.len(),
                    registry.action_count()
                );
            }
        },

        Commands::Models => {
            let catalog = config.models.catalog()?;
            let default_id = catalog.default_profile().id.clone();
            println!("Models ({}):", catalog.profiles().len());
            for profile in catalog.profiles() {
                let tier = if profile.write_capable { "write" } else { "read-only" };
                let marker = if profile.id == default_id { " (default)" } else { "" };
                println!("  {} / {profile} [{tier}]{marker}", profile.id);
            }
        }

        Commands::Policy {
            action:
                PolicyAction::Eval {
                    skill,
                    action,
                    model,
                    params,
                },
        } => {
            let registry = load_registry(&config)?;
            let Some(descriptor) = registry.lookup(&skill, &action) else {
                miette::bail!("unknown action {skill}.{action}");
            };
            let catalog = config.models.catalog()?;
            let profile = match &model {
                Some(id) => catalog
                    .get(id)
                    .ok_or_else(|| miette::miette!("unknown model \"{id}\""))?,
                None => catalog.default_profile(),
            };
            let params = BoundParams::parse(&params)?;
            let engine = PolicyEngine::from_config(&config.policy)?;

            let verdict = engine.evaluate(&descriptor, profile, &params);
            println!("{}.{} under {}: {verdict}", skill, action, profile.id);
            if let PolicyVerdict::Allow | PolicyVerdict::RequireConfirmation { .. } = verdict {
                if let Err(e) = colonel::executor::validate(&descriptor, &params) {
                    println!("  note: would fail validation: {e}");
                }
            }
        }

        Commands::Audit {
            action:
                AuditAction::Query {
                    file,
                    skill,
                    action,
                    user,
                    session,
                    outcome,
                    limit,
                    json,
                },
        } => {
            let Some(path) = file.or_else(|| config.audit.path.clone()) else {
                miette::bail!("no audit log: pass --file or set audit.path in the config");
            };
            let outcome = outcome
                .map(|o| {
                    serde_json::from_value::<AuditOutcome>(serde_json::Value::String(o.clone()))
                        .map_err(|_| miette::miette!("unknown outcome \"{o}\""))
                })
                .transpose()?;
            let filter = AuditFilter {
                skill,
                action,
                user_id: user,
                session_id: session,
                outcome,
                limit: Some(limit),
                offset: None,
            };
            let entries = JsonlAuditStore::new(path).query(&filter).await?;
            if entries.is_empty() {
                println!("No matching audit entries.");
            }
            for entry in &entries {
                if json {
                    println!("{}", serde_json::to_string(entry).into_diagnostic()?);
                } else {
                    let reason = entry
                        .deny_reason
                        .as_ref()
                        .map(|r| format!(" ({r})"))
                        .unwrap_or_default();
                    println!(
                        "{} {:<17} {}.{} user={} session={} model={}{reason}",
                        entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        entry.outcome.as_str(),
                        entry.skill,
                        entry.action,
                        entry.user_id,
                        entry.session_id,
                        entry.model_id,
                    );
                }
            }
        }
    }

    Ok(())
}

fn load_registry(config: &ColonelConfig) -> Result<Registry> {
    let registry = Registry::from_dirs(&config.skills.dirs, &CapabilityBindings::new())?;
    Ok(registry.retain_enabled(&config.skills.enabled))
}

fn print_registry(registry: &Registry) {
    if registry.is_empty() {
        println!("No skills loaded.");
        return;
    }
    println!("Skills ({}, {} actions):", registry.len(), registry.action_count());
    for skill in registry.skills() {
        println!("  {} ({})", skill.name, skill.origin);
        if !skill.description.is_empty() {
            println!("    {}", skill.description);
        }
        for action in &skill.actions {
            let confirm = if action.confirmation_required { " [confirm]" } else { "" };
            println!(
                "    - {} [{}]{confirm}: {}",
                action.name, action.category, action.description
            );
            for param in &action.params {
                let required = if param.required { "required" } else { "optional" };
                println!("        {}: {} ({required})", param.name, param.ty);
            }
        }
    }
}
