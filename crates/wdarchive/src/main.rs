use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use log::info;
use wdarchive_core::client::{WikidotApi, WikidotClient};
use wdarchive_core::config::{ArchiveConfig, ClientSettings, load_config, resolve_config_path};
use wdarchive_core::dump::{DumpOptions, DumpSummary, convert_git_archive, dump_site, recorded_site};
use wdarchive_core::jobs::{JobEvent, JobManager, JobStatus};
use wdarchive_core::logging::init_logging;
use wdarchive_core::model::{PageFormat, RevisionEntry, Selector};
use wdarchive_core::progress::{ProgressSink, StdoutProgress};

#[derive(Debug, Parser)]
#[command(
    name = "wdarchive",
    version,
    about = "Archive the revision history of a Wikidot site into a git repository"
)]
struct Cli {
    #[arg(long, global = true, value_name = "URL", help = "Site base URL")]
    site: Option<String>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, value_name = "MS", help = "Minimum delay between requests")]
    delay: Option<u64>,
    #[arg(long, global = true, help = "Enable debug logging")]
    debug: bool,
    #[arg(long, global = true, value_name = "PATH", help = "Also write rotating log files here")]
    log_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(name = "list-pages")]
    ListPages(SelectorArgs),
    #[command(name = "count-pages")]
    CountPages(SelectorArgs),
    Source(PageArgs),
    Content(PageArgs),
    Log(LogArgs),
    Rates(PageArgs),
    Dump(DumpArgs),
    Convert(ConvertArgs),
}

#[derive(Debug, Args)]
struct SelectorArgs {
    #[arg(long, value_name = "NAME", help = "Category to list (default: all)")]
    category: Option<String>,
    #[arg(long, value_name = "TAGS")]
    tags: Option<String>,
    #[arg(long, value_name = "USER", help = "Only pages created by this user")]
    creator: Option<String>,
    #[arg(long, value_name = "N")]
    max_page_count: Option<usize>,
}

impl SelectorArgs {
    fn selector(&self) -> Selector {
        Selector {
            category: self.category.clone().unwrap_or_else(|| ".".to_string()),
            tags: self.tags.clone(),
            created_by: self.creator.clone(),
        }
    }
}

#[derive(Debug, Args)]
struct PageArgs {
    #[arg(long, value_name = "NAME")]
    page: String,
}

#[derive(Debug, Args)]
struct LogArgs {
    #[arg(long, value_name = "NAME")]
    page: String,
    #[arg(long, value_name = "N")]
    depth: Option<usize>,
}

#[derive(Debug, Args)]
struct DumpArgs {
    #[arg(value_name = "DIR")]
    dir: PathBuf,
    #[arg(long = "page", value_name = "NAME", help = "Archive only these pages (repeatable)")]
    pages: Vec<String>,
    #[arg(long, value_name = "N", help = "Most recent revisions fetched per page")]
    depth: Option<usize>,
    #[arg(long, value_name = "N")]
    max_page_count: Option<usize>,
    #[arg(long, value_name = "NAME")]
    category: Option<String>,
    #[arg(long, value_name = "TAGS")]
    tags: Option<String>,
    #[arg(long, value_name = "USER")]
    creator: Option<String>,
    #[arg(long, value_name = "IDS", value_delimiter = ',', help = "Change ids to skip")]
    skip: Vec<i64>,
    #[arg(long, value_name = "NAMES", value_delimiter = ',', help = "Pages whose changes are skipped")]
    skip_pages: Vec<String>,
    #[arg(long, help = "Delete the state database after a completed run")]
    cleanup: bool,
    #[arg(long, value_name = "FORMAT", help = "legacy|new")]
    format: Option<String>,
    #[arg(long, help = "Keep the last committed change id in .revid")]
    revids: bool,
}

#[derive(Debug, Args)]
struct ConvertArgs {
    #[arg(value_name = "DIR")]
    dir: PathBuf,
    #[arg(long, value_name = "FORMAT", help = "legacy|new")]
    format: String,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(if cli.debug { "debug" } else { "info" }, cli.log_dir.as_deref())?;

    let cwd = env::current_dir().context("failed to resolve current directory")?;
    let config_path = resolve_config_path(cli.config.as_deref(), &cwd);
    let config = load_config(&config_path)?;

    match &cli.command {
        Some(Commands::ListPages(args)) => run_list_pages(&cli, &config, args),
        Some(Commands::CountPages(args)) => run_count_pages(&cli, &config, args),
        Some(Commands::Source(args)) => run_source(&cli, &config, &args.page),
        Some(Commands::Content(args)) => run_content(&cli, &config, &args.page),
        Some(Commands::Log(args)) => run_log(&cli, &config, args),
        Some(Commands::Rates(args)) => run_rates(&cli, &config, &args.page),
        Some(Commands::Dump(args)) => run_dump(&cli, &config, args),
        Some(Commands::Convert(args)) => run_convert(args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn client_settings(
    cli: &Cli,
    config: &ArchiveConfig,
    fallback_site: Option<String>,
) -> Result<ClientSettings> {
    let Some(site) = cli.site.clone().or_else(|| config.site_url()).or(fallback_site) else {
        bail!("no site configured; pass --site or set WDARCHIVE_SITE");
    };
    let mut settings = config.client_settings(&site);
    if let Some(delay) = cli.delay {
        settings.delay_ms = delay;
    }
    Ok(settings)
}

fn connect(cli: &Cli, config: &ArchiveConfig) -> Result<WikidotClient> {
    WikidotClient::new(client_settings(cli, config, None)?)
}

fn require_page_id(client: &mut WikidotClient, page: &str) -> Result<i64> {
    match client.get_page_id(page)? {
        Some(page_id) => Ok(page_id),
        None => bail!("page not found: {page}"),
    }
}

fn latest_revision(client: &mut WikidotClient, page: &str) -> Result<RevisionEntry> {
    let page_id = require_page_id(client, page)?;
    match client.get_changes(page_id, 1)?.into_iter().next() {
        Some(revision) => Ok(revision),
        None => bail!("page has no revisions: {page}"),
    }
}

fn run_list_pages(cli: &Cli, config: &ArchiveConfig, args: &SelectorArgs) -> Result<()> {
    let mut client = connect(cli, config)?;
    let limit = args.max_page_count.unwrap_or_else(|| config.max_page_count());
    for page in client.list_pages(&args.selector(), limit)? {
        println!("{page}");
    }
    Ok(())
}

fn run_count_pages(cli: &Cli, config: &ArchiveConfig, args: &SelectorArgs) -> Result<()> {
    let mut client = connect(cli, config)?;
    let limit = args.max_page_count.unwrap_or_else(|| config.max_page_count());
    let pages = client.list_pages(&args.selector(), limit)?;
    println!("pages: {}", pages.len());
    Ok(())
}

fn run_source(cli: &Cli, config: &ArchiveConfig, page: &str) -> Result<()> {
    let mut client = connect(cli, config)?;
    let revision = latest_revision(&mut client, page)?;
    println!("{}", client.get_change_source(revision.id)?);
    Ok(())
}

fn run_content(cli: &Cli, config: &ArchiveConfig, page: &str) -> Result<()> {
    let mut client = connect(cli, config)?;
    let revision = latest_revision(&mut client, page)?;
    let version = client.get_change_version(revision.id)?;
    if let Some(title) = &version.title {
        println!("title: {title}");
    }
    println!("{}", version.rendered_content);
    for image in &version.images {
        println!("image: {} -> {}", image.source_url, image.target_path);
    }
    Ok(())
}

fn run_log(cli: &Cli, config: &ArchiveConfig, args: &LogArgs) -> Result<()> {
    let mut client = connect(cli, config)?;
    let page_id = require_page_id(&mut client, &args.page)?;
    let depth = args.depth.unwrap_or_else(|| config.depth());
    println!("page_id: {page_id}");
    for revision in client.get_changes(page_id, depth)? {
        println!(
            "{} {} {} {} {}",
            revision.id,
            revision.date,
            revision.flag.as_ref().map_or("-", |flag| flag.as_str()),
            revision.user.as_deref().unwrap_or("<unknown>"),
            revision.comment
        );
    }
    Ok(())
}

fn run_rates(cli: &Cli, config: &ArchiveConfig, page: &str) -> Result<()> {
    let mut client = connect(cli, config)?;
    let page_id = require_page_id(&mut client, page)?;
    let ratings = client.get_ratings(page_id)?;
    println!("normal: {}", ratings.normal.len());
    for (user, vote) in &ratings.normal {
        println!("  {user}: {vote}");
    }
    println!("deleted: {}", ratings.deleted.len());
    for (account, vote) in &ratings.deleted {
        println!("  {account}: {vote}");
    }
    Ok(())
}

fn run_dump(cli: &Cli, config: &ArchiveConfig, args: &DumpArgs) -> Result<()> {
    let settings = client_settings(cli, config, recorded_site(&args.dir)?)?;
    let format = match &args.format {
        Some(format) => Some(PageFormat::parse(format)?),
        None => config.format()?,
    };
    let options = DumpOptions {
        pages: args.pages.clone(),
        category: args.category.clone(),
        tags: args.tags.clone(),
        created_by: args.creator.clone(),
        depth: args.depth.unwrap_or_else(|| config.depth()),
        max_page_count: args.max_page_count.unwrap_or_else(|| config.max_page_count()),
        ignored_pages: config.ignored_pages(),
        format,
        skip_changes: args.skip.iter().copied().collect(),
        skip_pages: args.skip_pages.iter().cloned().collect::<HashSet<_>>(),
        store_rev_ids: args.revids || config.store_rev_ids(),
        cleanup: args.cleanup,
    };

    println!("site: {}", settings.site_url);
    println!("target: {}", normalize_path(&args.dir));
    info!(
        "event=dump_requested module=cli site={} target={}",
        settings.site_url,
        args.dir.display()
    );

    let manager = JobManager::new();
    let dir = args.dir.clone();
    let (id, events) = manager.start(&args.dir, move |progress, cancel| {
        let summary = dump_site(settings, &dir, &options, progress, cancel)?;
        report_summary(progress, &summary);
        Ok(())
    })?;
    for event in events {
        match event {
            JobEvent::Progress { line, .. } => println!("{line}"),
            JobEvent::Finished { .. } => break,
        }
    }

    let snapshot = manager.wait(id)?;
    match snapshot.status {
        JobStatus::Completed => {
            println!("status: completed");
            Ok(())
        }
        JobStatus::Cancelled => {
            println!("status: cancelled");
            Ok(())
        }
        JobStatus::Running => bail!("dump job {id} is still running"),
        JobStatus::Failed(reason) => bail!("dump failed: {reason}"),
    }
}

fn report_summary(progress: &dyn ProgressSink, summary: &DumpSummary) {
    if let Some(commit) = &summary.conversion {
        progress.report(&format!("conversion_commit: {commit}"));
    }
    progress.report(&format!("pages: {}", summary.compile.page_count));
    progress.report(&format!("missing_pages: {}", summary.compile.missing_pages));
    progress.report(&format!("total_changes: {}", summary.compile.total_changes));
    progress.report(&format!("committed: {}", summary.run.committed));
    progress.report(&format!("already_committed: {}", summary.run.already_committed));
    progress.report(&format!("skipped: {}", summary.run.skipped));
    progress.report(&format!("complete: {}", format_flag(summary.complete)));
    progress.report(&format!("cleaned_up: {}", format_flag(summary.cleaned_up)));
}

fn run_convert(args: &ConvertArgs) -> Result<()> {
    let target = PageFormat::parse(&args.format)?;
    println!("target: {}", normalize_path(&args.dir));
    match convert_git_archive(&args.dir, target, &StdoutProgress)? {
        Some(commit) => println!("conversion_commit: {commit}"),
        None => println!("conversion_commit: <none, already {target}>"),
    }
    Ok(())
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
