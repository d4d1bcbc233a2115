use std::env;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use wikilocalizer_core::client::{MediaWikiClient, MediaWikiClientConfig};
use wikilocalizer_core::config::{LocalizerConfig, default_config_path, load_config};
use wikilocalizer_core::localizer::{LocalizeReport, LocalizerSettings, WikiLocalizer};
use wikilocalizer_core::publish::{Credentials, PublishOptions, PublishReport, localize_page};
use wikilocalizer_core::resolver::{LangLinkResolver, ResolutionOutcome};

#[derive(Debug, Parser)]
#[command(
    name = "wikilocalizer",
    version,
    about = "Point wikilinks at local-language articles, annotating foreign-only targets"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved configuration before running")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Localize the links of a page on the local wiki")]
    Localize(LocalizeArgs),
    #[command(name = "localize-file", about = "Localize the links of a wikitext file")]
    LocalizeFile(LocalizeFileArgs),
    #[command(about = "Show how a single link target resolves")]
    Resolve(ResolveArgs),
    #[command(about = "Print the resolved configuration")]
    Config,
}

#[derive(Debug, Args)]
struct LocalizeArgs {
    title: String,
    #[arg(long, help = "Save the localized text (needs WIKI_BOT_USER and WIKI_BOT_PASS)")]
    save: bool,
    #[arg(long, value_name = "TEXT", help = "Edit summary used when saving")]
    summary: Option<String>,
    #[arg(long, help = "Print the report as JSON")]
    json: bool,
    #[arg(long, help = "Do not print the diff")]
    no_diff: bool,
}

#[derive(Debug, Args)]
struct LocalizeFileArgs {
    #[arg(value_name = "PATH", help = "Wikitext file, or - for stdin")]
    path: PathBuf,
    #[arg(short, long, value_name = "PATH", help = "Write the localized text here instead of stdout")]
    output: Option<PathBuf>,
    #[arg(long, help = "Print the report as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct ResolveArgs {
    target: String,
    #[arg(long, help = "Print the outcome as JSON")]
    json: bool,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = load_runtime_config(cli.config.as_deref())?;
    if cli.diagnostics {
        eprintln!("[diagnostics]\n{}", config.diagnostics());
    }

    match cli.command {
        Some(Commands::Localize(args)) => run_localize(&config, args),
        Some(Commands::LocalizeFile(args)) => run_localize_file(&config, args),
        Some(Commands::Resolve(args)) => run_resolve(&config, args),
        Some(Commands::Config) => {
            println!("{}", config.diagnostics());
            Ok(())
        }
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn load_runtime_config(explicit: Option<&Path>) -> Result<LocalizerConfig> {
    let path = match explicit {
        Some(path) => {
            if !path.exists() {
                bail!("config file not found: {}", normalize_path(path));
            }
            path.to_path_buf()
        }
        None => {
            let cwd = env::current_dir().context("failed to read current directory")?;
            default_config_path(&cwd)
        }
    };
    load_config(&path)
}

fn build_clients(config: &LocalizerConfig) -> Result<(MediaWikiClient, MediaWikiClient)> {
    let local = MediaWikiClient::new(MediaWikiClientConfig::local_from_config(config))
        .context("failed to set up local wiki client")?;
    let foreign = MediaWikiClient::new(MediaWikiClientConfig::foreign_from_config(config))
        .context("failed to set up foreign wiki client")?;
    Ok((local, foreign))
}

fn run_localize(config: &LocalizerConfig, args: LocalizeArgs) -> Result<()> {
    let (mut local, mut foreign) = build_clients(config)?;
    let options = PublishOptions {
        save: args.save,
        summary: args.summary.unwrap_or_else(|| config.edit_summary()),
        settings: LocalizerSettings::from_config(config),
        credentials: if args.save {
            Credentials::from_env()
        } else {
            None
        },
    };

    let report = localize_page(&mut local, &mut foreign, &args.title, &options)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_publish_report(&report, !args.no_diff);
    }
    Ok(())
}

fn run_localize_file(config: &LocalizerConfig, args: LocalizeFileArgs) -> Result<()> {
    let text = read_input(&args.path)?;
    let (local, foreign) = build_clients(config)?;
    let mut localizer = WikiLocalizer::new(local, foreign, &LocalizerSettings::from_config(config));
    let report = localizer.localize_content(&text);

    if let Some(output) = &args.output {
        fs::write(output, &report.text)
            .with_context(|| format!("failed to write {}", normalize_path(output)))?;
    }
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    if args.output.is_none() {
        print!("{}", report.text);
    }
    print_localize_summary(&report);
    Ok(())
}

fn run_resolve(config: &LocalizerConfig, args: ResolveArgs) -> Result<()> {
    let (local, foreign) = build_clients(config)?;
    let mut resolver = LangLinkResolver::new(local, foreign, config.local_lang())
        .with_max_redirect_hops(config.max_redirect_hops());
    let resolution = resolver.resolve(&args.target);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&resolution.outcome)?);
    } else {
        match &resolution.outcome {
            ResolutionOutcome::LocalFound { resolved_title } => {
                println!("local_found: {resolved_title}")
            }
            ResolutionOutcome::ForeignOnly { foreign_title } => {
                println!("foreign_only: {foreign_title}")
            }
            ResolutionOutcome::NotFound => println!("not_found"),
        }
    }
    for error in &resolution.errors {
        eprintln!("warning: {error}");
    }
    Ok(())
}

fn print_publish_report(report: &PublishReport, show_diff: bool) {
    println!("localize {}", report.title);
    println!("revision_id: {}", report.revision_id);
    println!("status: {}", publish_status_label(report));
    if let Some(revision) = report.new_revision_id {
        println!("new_revision_id: {revision}");
    }
    println!("links_seen: {}", report.links_seen);
    println!("links_replaced: {}", report.links_replaced);
    println!("fallbacks: {}", report.fallbacks);
    println!("request_count: {}", report.request_count);
    if !report.errors.is_empty() {
        println!("errors:");
        for error in &report.errors {
            println!("  - {error}");
        }
    }
    if show_diff && !report.diff.is_empty() {
        println!();
        print!("{}", report.diff);
    }
}

fn print_localize_summary(report: &LocalizeReport) {
    eprintln!("links_seen: {}", report.links_seen);
    eprintln!("links_skipped: {}", report.links_skipped);
    eprintln!("links_replaced: {}", report.links_replaced);
    eprintln!("fallbacks: {}", report.fallbacks);
    if !report.errors.is_empty() {
        eprintln!("errors:");
        for error in &report.errors {
            eprintln!("  - {error}");
        }
    }
}

fn publish_status_label(report: &PublishReport) -> String {
    serde_json::to_value(&report.status)
        .ok()
        .and_then(|value| value.as_str().map(ToString::to_string))
        .unwrap_or_else(|| format!("{:?}", report.status))
}

fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("failed to read stdin")?;
        return Ok(buffer);
    }
    fs::read_to_string(path).with_context(|| format!("failed to read {}", normalize_path(path)))
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
