//! PromptBandit CLI - inspect and drive the prompt optimizer

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use promptbandit_core::config::Config;
use promptbandit_core::llm::{GenerationParams, build_generator};
use promptbandit_core::optimizer::{
    Algorithm, PromptOptimizer, SqliteOptimizerStore, SynthesisContext, TemplateSummary,
    default_templates,
};
use serde_json::{Value, json};
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "promptbandit")]
#[command(author, version, about = "Bandit-driven prompt optimization for policy synthesis", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Debug, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage prompt templates
    Templates {
        #[command(subcommand)]
        action: TemplateAction,
    },

    /// Show which template the optimizer would pick
    Select {
        #[command(flatten)]
        context: ContextArgs,
    },

    /// Run select -> generate -> report cycles with the configured generator
    Simulate {
        /// Number of cycles
        #[arg(short, long, default_value_t = 20)]
        rounds: u32,

        /// Override the configured algorithm for this run
        #[arg(short, long)]
        algorithm: Option<Algorithm>,

        /// Fixed RNG seed for reproducible runs
        #[arg(long)]
        seed: Option<u64>,

        /// Name of the optimization session to record into
        #[arg(long, default_value = "simulation")]
        session_name: String,

        #[command(flatten)]
        context: ContextArgs,
    },

    /// Show optimization metrics
    Metrics {
        /// Print Prometheus text exposition instead
        #[arg(long)]
        prometheus: bool,
    },

    /// Show the best performing templates
    Top {
        /// How many templates to show
        #[arg(short = 'k', long, default_value_t = 3)]
        top_k: usize,
    },

    /// Export performance and selection history as JSON lines
    Export {
        /// Output directory
        dir: PathBuf,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum TemplateAction {
    /// List all templates with their statistics
    List,
    /// Register any built-in templates that are missing
    Seed,
    /// Show one template
    Show { id: String },
    /// Stop selecting a template (history is kept)
    Deactivate { id: String },
    /// Make a template selectable again
    Activate { id: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// List all config values
    List,
    /// Reset config to defaults
    Reset,
    /// Show config file path
    Path,
}

/// Synthesis context assembled from flags
#[derive(clap::Args, Debug, Default)]
struct ContextArgs {
    /// Template category to prefer
    #[arg(short, long)]
    category: Option<String>,

    /// Constitutional principle (repeatable)
    #[arg(long = "principle")]
    principles: Vec<String>,

    /// Synthesis requirement (repeatable)
    #[arg(long = "requirement")]
    requirements: Vec<String>,

    /// Extra context as a JSON object, merged under the flags
    #[arg(long)]
    context_json: Option<String>,
}

impl ContextArgs {
    fn to_context(&self) -> anyhow::Result<SynthesisContext> {
        let mut context = match &self.context_json {
            Some(raw) => {
                let value: Value =
                    serde_json::from_str(raw).context("--context-json is not valid JSON")?;
                SynthesisContext::from_value(value)?
            }
            None => SynthesisContext::new(),
        };
        if let Some(category) = &self.category {
            context = context.with_category(category.clone());
        }
        if !self.principles.is_empty() {
            context = context.with("principles", json!(self.principles));
        }
        if !self.requirements.is_empty() {
            context = context.with("requirements", json!(self.requirements));
        }
        Ok(context)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let default_level = if cli.quiet {
        "promptbandit=warn"
    } else {
        "promptbandit=info"
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.parse()?),
        )
        .init();

    match cli.command {
        Commands::Templates { action } => cmd_templates(action, cli.format, cli.quiet).await,

        Commands::Select { context } => cmd_select(&context, cli.format).await,

        Commands::Simulate {
            rounds,
            algorithm,
            seed,
            session_name,
            context,
        } => {
            cmd_simulate(
                rounds,
                algorithm,
                seed,
                &session_name,
                &context,
                cli.format,
                cli.quiet,
            )
            .await
        }

        Commands::Metrics { prometheus } => cmd_metrics(prometheus, cli.format).await,

        Commands::Top { top_k } => cmd_top(top_k, cli.format).await,

        Commands::Export { dir } => cmd_export(&dir, cli.format, cli.quiet).await,

        Commands::Config { action } => cmd_config(action, cli.quiet),
    }
}

/// Open the persistent optimizer described by the configuration
async fn open_optimizer(
    config: &Config,
    algorithm: Option<Algorithm>,
    seed: Option<u64>,
) -> anyhow::Result<PromptOptimizer> {
    let database_path = config.database_path()?;
    debug!(path = %database_path.display(), "Opening optimizer database");

    let store = SqliteOptimizerStore::connect(&database_path)
        .await
        .with_context(|| format!("Failed to open database: {}", database_path.display()))?;
    store.init().await?;

    let mut mab = config.mab.clone();
    if let Some(algorithm) = algorithm {
        mab.algorithm = algorithm;
    }

    let mut builder = PromptOptimizer::builder().config(mab).store(Arc::new(store));
    if let Some(seed) = seed {
        builder = builder.seed(seed);
    }
    let optimizer = builder.build()?;
    optimizer.bootstrap().await?;
    Ok(optimizer)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_summaries(summaries: &[TemplateSummary]) {
    println!(
        "{:<26} {:<18} {:>6} {:>8} {:>8}  {:<15} {}",
        "ID", "CATEGORY", "USES", "AVG", "SUCCESS", "INTERVAL", "ACTIVE"
    );
    for t in summaries {
        println!(
            "{:<26} {:<18} {:>6} {:>8.3} {:>7.1}%  [{:.2}, {:.2}]    {}",
            t.id,
            t.category,
            t.total_uses,
            t.average_reward,
            t.success_rate * 100.0,
            t.confidence_lower,
            t.confidence_upper,
            if t.is_active { "yes" } else { "no" }
        );
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_templates(
    action: TemplateAction,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let config = Config::load()?;
    let optimizer = open_optimizer(&config, None, None).await?;

    match action {
        TemplateAction::List => {
            let summaries: Vec<TemplateSummary> = optimizer
                .templates()
                .iter()
                .map(TemplateSummary::from)
                .collect();
            match format {
                OutputFormat::Json => print_json(&summaries)?,
                OutputFormat::Text => print_summaries(&summaries),
            }
        }
        TemplateAction::Seed => {
            let mut added = Vec::new();
            for template in default_templates() {
                if optimizer.template(&template.id).is_err() {
                    added.push(template.id.clone());
                    optimizer.register_prompt_template(template).await?;
                }
            }
            match format {
                OutputFormat::Json => print_json(&json!({ "added": added }))?,
                OutputFormat::Text if !quiet => {
                    if added.is_empty() {
                        println!("All built-in templates are already registered.");
                    } else {
                        println!("Registered {} template(s): {}", added.len(), added.join(", "));
                    }
                }
                OutputFormat::Text => {}
            }
        }
        TemplateAction::Show { id } => {
            let template = optimizer.template(&id)?;
            match format {
                OutputFormat::Json => print_json(&template)?,
                OutputFormat::Text => {
                    println!("{} ({} v{})", template.name, template.id, template.version);
                    println!("Category: {}", template.category);
                    println!("Active:   {}", template.is_active);
                    if let Some(description) = &template.description {
                        println!("About:    {}", description);
                    }
                    println!(
                        "Uses: {}  Average reward: {:.3}  Successes: {}",
                        template.stats.total_uses,
                        template.stats.average_reward,
                        template.stats.success_count
                    );
                    println!();
                    println!("{}", template.content);
                }
            }
        }
        TemplateAction::Deactivate { id } => {
            optimizer.deactivate_template(&id).await?;
            if !quiet {
                println!("Deactivated {}", id);
            }
        }
        TemplateAction::Activate { id } => {
            optimizer.activate_template(&id).await?;
            if !quiet {
                println!("Activated {}", id);
            }
        }
    }
    Ok(())
}

async fn cmd_select(args: &ContextArgs, format: OutputFormat) -> anyhow::Result<()> {
    let config = Config::load()?;
    let optimizer = open_optimizer(&config, None, None).await?;
    let context = args.to_context()?;

    let (template, token) = optimizer.select_optimal_prompt(&context)?;
    match format {
        OutputFormat::Json => print_json(&json!({
            "template": template,
            "token": token,
            "prompt": template.fill(&context),
        }))?,
        OutputFormat::Text => {
            println!("Selected: {} ({})", template.id, template.name);
            println!("Category: {}", template.category);
            println!();
            println!("{}", template.fill(&context));
        }
    }
    Ok(())
}

async fn cmd_simulate(
    rounds: u32,
    algorithm: Option<Algorithm>,
    seed: Option<u64>,
    session_name: &str,
    args: &ContextArgs,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let config = Config::load()?;
    let optimizer = open_optimizer(&config, algorithm, seed).await?;
    let generator = build_generator(&config.llm)?;
    let params = GenerationParams::from(&config.llm);

    let session = optimizer.start_session(session_name).await;
    let context = args.to_context()?.with_session(session.id.clone());

    info!(
        rounds = rounds,
        generator = generator.name(),
        algorithm = %optimizer.config().algorithm,
        "Starting simulation"
    );

    for round in 1..=rounds {
        let outcome = optimizer
            .synthesize(generator.as_ref(), &context, &params)
            .await?;
        if !quiet && format == OutputFormat::Text {
            println!(
                "[{:>3}] {:<26} reward {:.3}{}",
                round,
                outcome.template.id,
                outcome.reward.composite_score,
                outcome
                    .generation_error
                    .map(|e| format!("  ({})", e))
                    .unwrap_or_default()
            );
        }
    }

    let session = optimizer.end_session(&session.id).await?;
    optimizer.flush().await?;

    match format {
        OutputFormat::Json => print_json(&session)?,
        OutputFormat::Text => {
            println!();
            println!(
                "Session '{}': {} observations, average reward {:.3}",
                session.name, session.total_observations, session.average_reward
            );
            if let Some(best) = &session.best_template_id {
                println!(
                    "Best template: {} ({:.3})",
                    best, session.best_template_reward
                );
            }
            println!(
                "Exploration rate: {:.1}%",
                session.exploration_rate * 100.0
            );
            match session.convergence_iteration {
                Some(iteration) => println!("Converged at observation {}", iteration),
                None => println!("Not converged"),
            }
        }
    }
    Ok(())
}

async fn cmd_metrics(prometheus: bool, format: OutputFormat) -> anyhow::Result<()> {
    let config = Config::load()?;
    let optimizer = open_optimizer(&config, None, None).await?;

    if prometheus {
        print!("{}", optimizer.render_prometheus()?);
        return Ok(());
    }

    let metrics = optimizer.get_optimization_metrics();
    match format {
        OutputFormat::Json => print_json(&metrics)?,
        OutputFormat::Text => {
            println!("Algorithm:            {}", metrics.algorithm);
            println!("Total optimizations:  {}", metrics.total_optimizations);
            println!(
                "Overall success rate: {:.1}% ({}/{})",
                metrics.overall_success_rate * 100.0,
                metrics.total_successes,
                metrics.total_template_uses
            );
            println!(
                "Templates:            {} active / {} registered",
                metrics.active_templates, metrics.registered_templates
            );
            println!();
            print_summaries(&metrics.templates);
        }
    }
    Ok(())
}

async fn cmd_top(top_k: usize, format: OutputFormat) -> anyhow::Result<()> {
    let config = Config::load()?;
    let optimizer = open_optimizer(&config, None, None).await?;
    let best = optimizer.get_best_performing_templates(top_k);

    match format {
        OutputFormat::Json => print_json(&best)?,
        OutputFormat::Text => print_summaries(&best),
    }
    Ok(())
}

async fn cmd_export(dir: &Path, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    let config = Config::load()?;
    let optimizer = open_optimizer(&config, None, None).await?;
    let (performance, selections) = optimizer.export_history(dir).await?;

    match format {
        OutputFormat::Json => print_json(&json!({
            "performance": performance.display().to_string(),
            "selections": selections.display().to_string(),
        }))?,
        OutputFormat::Text if !quiet => {
            println!("Wrote {}", performance.display());
            println!("Wrote {}", selections.display());
        }
        OutputFormat::Text => {}
    }
    Ok(())
}

fn cmd_config(action: ConfigAction, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load()?;
            let items = config.list()?;
            for (key, value) in items {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Reset => {
            Config::reset()?;
            if !quiet {
                println!("Configuration reset to defaults.");
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_simulate_args_parse() {
        let cli = Cli::try_parse_from([
            "promptbandit",
            "simulate",
            "--rounds",
            "5",
            "--algorithm",
            "ucb1",
            "--principle",
            "Be fair",
            "--principle",
            "Be safe",
            "--format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
        match cli.command {
            Commands::Simulate {
                rounds,
                algorithm,
                context,
                ..
            } => {
                assert_eq!(rounds, 5);
                assert_eq!(algorithm, Some(Algorithm::Ucb1));
                assert_eq!(context.principles.len(), 2);
            }
            _ => panic!("expected simulate"),
        }
    }

    #[test]
    fn test_context_args_merge() {
        let args = ContextArgs {
            category: Some("fairness_aware".to_string()),
            principles: vec!["Treat groups equally".to_string()],
            requirements: Vec::new(),
            context_json: Some(r#"{"category": "other", "reference_policy": "package x"}"#.to_string()),
        };
        let context = args.to_context().unwrap();
        assert_eq!(context.category(), Some("fairness_aware"));
        assert_eq!(context.get_str("reference_policy"), Some("package x"));
        assert_eq!(context.string_list("principles"), vec!["Treat groups equally"]);
    }

    #[test]
    fn test_context_json_must_be_object() {
        let args = ContextArgs {
            context_json: Some("[1, 2]".to_string()),
            ..ContextArgs::default()
        };
        assert!(args.to_context().is_err());
    }
}
