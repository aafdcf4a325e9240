use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use log::info;

use crate::archiver::{Archiver, ArchiverOptions, ArchiverState, RunSummary};
use crate::client::{WikidotApi, WikidotClient};
use crate::compile::{CompileRequest, CompileSummary};
use crate::config::ClientSettings;
use crate::convert::convert_archive;
use crate::model::{PageFormat, Selector};
use crate::progress::{CancelToken, ProgressSink};
use crate::store::{ArchiveStore, METADATA_FILE, parse_metadata};
use crate::vcs::{GitRepository, VersionStore};

#[derive(Debug, Clone, Default)]
pub struct DumpOptions {
    /// Explicit page names; empty means "use the selector".
    pub pages: Vec<String>,
    /// Selector fields given on this run; unset fields fall back to the
    /// values recorded by earlier runs.
    pub category: Option<String>,
    pub tags: Option<String>,
    pub created_by: Option<String>,
    pub depth: usize,
    pub max_page_count: usize,
    pub ignored_pages: Vec<String>,
    pub format: Option<PageFormat>,
    pub skip_changes: HashSet<i64>,
    pub skip_pages: HashSet<String>,
    pub store_rev_ids: bool,
    pub cleanup: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpSummary {
    pub compile: CompileSummary,
    pub run: RunSummary,
    pub conversion: Option<String>,
    pub complete: bool,
    pub cleaned_up: bool,
}

pub fn merge_selector(recorded: Selector, options: &DumpOptions) -> Selector {
    Selector {
        category: options.category.clone().unwrap_or(recorded.category),
        tags: options.tags.clone().or(recorded.tags),
        created_by: options.created_by.clone().or(recorded.created_by),
    }
}

/// Compiles and commits everything the options select into `repo`.
pub fn run_dump<A: WikidotApi, V: VersionStore>(
    api: A,
    repo: V,
    options: &DumpOptions,
    progress: &dyn ProgressSink,
    cancel: &CancelToken,
) -> Result<DumpSummary> {
    let store = ArchiveStore::open(repo.root())?;
    let mut archiver = Archiver::open(
        api,
        repo,
        store,
        ArchiverOptions {
            initial_format: options.format,
            skip_changes: options.skip_changes.clone(),
            skip_pages: options.skip_pages.clone(),
            store_rev_ids: options.store_rev_ids,
        },
        progress,
    )?;

    let selector = merge_selector(archiver.metadata().selector(), options);
    archiver.set_selector(&selector);
    let conversion = archiver.ensure_format(options.format)?;

    let compile = archiver.compile(&CompileRequest {
        pages: options.pages.clone(),
        selector,
        depth: options.depth,
        max_page_count: options.max_page_count,
        ignored_pages: options.ignored_pages.clone(),
    })?;
    let run = archiver.run(cancel)?;
    let complete = !run.cancelled && archiver.state() == ArchiverState::Done;

    let mut cleaned_up = false;
    if options.cleanup && complete {
        archiver.cleanup()?;
        cleaned_up = true;
    }
    info!(
        "event=dump_done module=dump committed={} complete={complete} cleaned_up={cleaned_up}",
        run.committed
    );
    Ok(DumpSummary {
        compile,
        run,
        conversion,
        complete,
        cleaned_up,
    })
}

/// `run_dump` against the live wiki and a git repository at `root`.
pub fn dump_site(
    settings: ClientSettings,
    root: &Path,
    options: &DumpOptions,
    progress: &dyn ProgressSink,
    cancel: &CancelToken,
) -> Result<DumpSummary> {
    let client = WikidotClient::new(settings)?;
    let (repo, created) = GitRepository::open_or_init(root)?;
    if created {
        info!(
            "event=repository_created module=dump path={}",
            root.display()
        );
    }
    run_dump(client, repo, options, progress, cancel)
}

/// Site recorded by an earlier run into `root`, read without opening the
/// state database.
pub fn recorded_site(root: &Path) -> Result<Option<String>> {
    let path = root.join(METADATA_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let metadata = parse_metadata(&raw)?;
    Ok(Some(metadata.site).filter(|site| !site.is_empty()))
}

/// Converts an existing archive without contacting the wiki.
pub fn convert_existing<V: VersionStore>(
    mut repo: V,
    target: PageFormat,
    progress: &dyn ProgressSink,
) -> Result<Option<String>> {
    if !repo.has_commits()? {
        bail!("no archive found at {}", repo.root().display());
    }
    let store = ArchiveStore::open(repo.root())?;
    let Some(mut metadata) = store.load_metadata()? else {
        bail!(
            "archive at {} has no recorded metadata yet",
            repo.root().display()
        );
    };
    convert_archive(&mut repo, &store, &mut metadata, target, progress)
}

pub fn convert_git_archive(
    root: &Path,
    target: PageFormat,
    progress: &dyn ProgressSink,
) -> Result<Option<String>> {
    if !root.join(".git").exists() {
        bail!("no archive found at {}", root.display());
    }
    let (repo, _) = GitRepository::open_or_init(root)?;
    convert_existing(repo, target, progress)
}
