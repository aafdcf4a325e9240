//! Turns the compiled change list into one commit per change.
//!
//! The archiver walks the list in order from a persisted cursor. A change id
//! enters the committed-id log only inside the step that commits it, so a
//! restart at any point either replays the same step or skips it.
//!
//! Parent and tag reconstruction are best-effort: parents come from the
//! comment the wiki writes when a parent is assigned, and historical tags
//! come from diffing against another tag-flagged change of the same page or,
//! failing that, from the page's live tags. A comment that merely looks like
//! a parent assignment is taken at face value.

use std::collections::{BTreeSet, HashSet};
use std::fs;

use anyhow::{Context, Result, bail};
use log::{debug, info, warn};

use crate::client::{AssetOutcome, WikidotApi, site_host};
use crate::compile::{CompileRequest, CompileSummary, compile_changes};
use crate::convert::convert_archive;
use crate::model::{
    Change, LEGACY_EXTENSION, NEW_EXTENSION, PageFormat, Selector, page_file_name,
};
use crate::page_file::{PageHeader, has_header, render_page, replace_parent_field};
use crate::progress::{CancelToken, ProgressSink};
use crate::store::{
    ArchiveMetadata, ArchiveStore, FETCHED_LOG_FILE, IMAGES_DIR, METADATA_FILE,
    METADATA_TEMP_FILE, REVID_FILE,
};
use crate::vcs::{CleanScope, CommitRequest, Signature, VersionStore};

pub const INITIAL_COMMIT_MESSAGE: &str = "Initial creation of repo";
const PARENT_COMMENT_PREFIX: &str = "Parent page set to: \"";
const UNKNOWN_USER: &str = "unknown";

/// Untracked files a step can leave behind; recovery removes only these.
const RECOVERY_SCOPE: CleanScope<'static> = CleanScope {
    paths: &[
        IMAGES_DIR,
        FETCHED_LOG_FILE,
        METADATA_FILE,
        METADATA_TEMP_FILE,
        REVID_FILE,
    ],
    root_extensions: &[LEGACY_EXTENSION, NEW_EXTENSION],
};

#[derive(Debug, Clone, Default)]
pub struct ArchiverOptions {
    /// Format for a repository without recorded metadata.
    pub initial_format: Option<PageFormat>,
    pub skip_changes: HashSet<i64>,
    pub skip_pages: HashSet<String>,
    pub store_rev_ids: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiverState {
    Ready { cursor: usize, total: usize },
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Committed { change_id: i64, commit: String },
    AlreadyCommitted(i64),
    Skipped(i64),
    Done,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub committed: usize,
    pub already_committed: usize,
    pub skipped: usize,
    pub cancelled: bool,
}

pub struct Archiver<'p, A: WikidotApi, V: VersionStore> {
    api: A,
    repo: V,
    store: ArchiveStore,
    options: ArchiverOptions,
    progress: &'p dyn ProgressSink,
    changes: Vec<Change>,
    cursor: usize,
    committed: HashSet<i64>,
    metadata: ArchiveMetadata,
    failed_images: BTreeSet<String>,
    newest_committed_date: i64,
    site_host: String,
    /// Change whose step failed part-way; its edits are only undone by a reopen.
    failed_change: Option<i64>,
}

impl<'p, A: WikidotApi, V: VersionStore> Archiver<'p, A, V> {
    /// Opens the target, replaying crash recovery and creating the initial
    /// commit for a fresh repository.
    pub fn open(
        api: A,
        mut repo: V,
        store: ArchiveStore,
        options: ArchiverOptions,
        progress: &'p dyn ProgressSink,
    ) -> Result<Self> {
        if repo.has_commits()? {
            progress.report("Continuing from existing archive state...");
            recover_working_copy(&mut repo, &store, progress)?;
        } else {
            progress.report("Initializing repository...");
            create_initial_commit(&mut repo, &store, options.store_rev_ids)?;
        }

        let committed = store.load_committed()?.into_iter().collect::<HashSet<_>>();
        let mut metadata = store.load_metadata()?.unwrap_or_else(|| {
            ArchiveMetadata::new(
                &Selector::default(),
                options.initial_format.unwrap_or(PageFormat::New),
            )
        });
        if metadata.site.is_empty() {
            metadata.site = api.site_url().to_string();
        }
        let failed_images = store.load_failed_images()?;
        let cursor = store.load_cursor()?;
        let site_host = site_host(api.site_url());
        info!(
            "event=archiver_open module=archiver committed={} cursor={cursor} format={}",
            committed.len(),
            metadata.format()
        );

        Ok(Self {
            api,
            repo,
            store,
            options,
            progress,
            changes: Vec::new(),
            cursor,
            committed,
            metadata,
            failed_images,
            newest_committed_date: i64::MIN,
            site_host,
            failed_change: None,
        })
    }

    pub fn metadata(&self) -> &ArchiveMetadata {
        &self.metadata
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn committed(&self) -> &HashSet<i64> {
        &self.committed
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn repo(&self) -> &V {
        &self.repo
    }

    pub fn state(&self) -> ArchiverState {
        if self.cursor >= self.changes.len() {
            ArchiverState::Done
        } else {
            ArchiverState::Ready {
                cursor: self.cursor,
                total: self.changes.len(),
            }
        }
    }

    /// Records the selector; it is persisted with the next commit.
    pub fn set_selector(&mut self, selector: &Selector) {
        self.metadata.set_selector(selector);
    }

    /// Converts the archive when `requested` differs from the recorded
    /// format. Returns the conversion commit, if one was made.
    pub fn ensure_format(&mut self, requested: Option<PageFormat>) -> Result<Option<String>> {
        let Some(requested) = requested else {
            return Ok(None);
        };
        convert_archive(
            &mut self.repo,
            &self.store,
            &mut self.metadata,
            requested,
            self.progress,
        )
    }

    pub fn compile(&mut self, request: &CompileRequest) -> Result<CompileSummary> {
        let (changes, summary) = compile_changes(
            &mut self.api,
            &mut self.store,
            &self.committed,
            request,
            self.progress,
        )?;
        self.changes = changes;
        self.reconcile_cursor()?;
        Ok(summary)
    }

    /// Loads the cached change list without querying the wiki.
    pub fn load_cached_changes(&mut self) -> Result<()> {
        self.changes = self.store.load_changes()?;
        self.reconcile_cursor()
    }

    fn reconcile_cursor(&mut self) -> Result<()> {
        let first_uncommitted = self
            .changes
            .iter()
            .position(|change| !self.committed.contains(&change.id))
            .unwrap_or(self.changes.len());
        if first_uncommitted < self.cursor {
            warn!(
                "event=cursor_rewind module=archiver from={} to={first_uncommitted}",
                self.cursor
            );
        }
        self.cursor = first_uncommitted;
        self.store.save_cursor(self.cursor)?;
        self.newest_committed_date = self
            .changes
            .iter()
            .filter(|change| self.committed.contains(&change.id))
            .map(|change| change.date)
            .max()
            .unwrap_or(i64::MIN);
        Ok(())
    }

    /// Commits until the list is exhausted or `cancel` is raised.
    pub fn run(&mut self, cancel: &CancelToken) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let to_fetch = self
            .changes
            .iter()
            .filter(|change| !self.committed.contains(&change.id))
            .count();
        self.progress
            .report(&format!("Revisions to download: {to_fetch}"));
        loop {
            if cancel.is_cancelled() {
                info!(
                    "event=run_cancelled module=archiver cursor={}",
                    self.cursor
                );
                self.progress.report("Cancelled");
                summary.cancelled = true;
                break;
            }
            match self.commit_next()? {
                StepOutcome::Committed { .. } => summary.committed += 1,
                StepOutcome::AlreadyCommitted(_) => summary.already_committed += 1,
                StepOutcome::Skipped(_) => summary.skipped += 1,
                StepOutcome::Done => break,
            }
        }
        info!(
            "event=run_done module=archiver committed={} skipped={} requests={}",
            summary.committed,
            summary.skipped,
            self.api.request_count()
        );
        Ok(summary)
    }

    pub fn commit_next(&mut self) -> Result<StepOutcome> {
        if let Some(change_id) = self.failed_change {
            bail!("change {change_id} was left half-applied; reopen the archive to recover it");
        }
        let Some(change) = self.changes.get(self.cursor).cloned() else {
            return Ok(StepOutcome::Done);
        };

        if self.committed.contains(&change.id) {
            self.advance()?;
            return Ok(StepOutcome::AlreadyCommitted(change.id));
        }

        if self.options.skip_changes.contains(&change.id)
            || self.options.skip_pages.contains(&change.page_name)
        {
            info!(
                "event=change_skipped module=archiver change={} page={}",
                change.id, change.page_name
            );
            self.progress
                .report(&format!("Skipping {} ({})", change.id, change.page_name));
            self.advance()?;
            return Ok(StepOutcome::Skipped(change.id));
        }

        if change.date < self.newest_committed_date {
            warn!(
                "event=ordering_anomaly module=archiver change={} date={} newest_committed={}",
                change.id, change.date, self.newest_committed_date
            );
        }

        let commit = match self.materialize(&change) {
            Ok(commit) => commit,
            Err(error) => {
                self.failed_change = Some(change.id);
                return Err(error.context(format!(
                    "failed to archive change {} of {}",
                    change.id, change.page_name
                )));
            }
        };
        self.committed.insert(change.id);
        self.newest_committed_date = self.newest_committed_date.max(change.date);
        self.advance()?;
        Ok(StepOutcome::Committed {
            change_id: change.id,
            commit,
        })
    }

    fn advance(&mut self) -> Result<()> {
        self.cursor += 1;
        self.store.save_cursor(self.cursor)
    }

    fn materialize(&mut self, change: &Change) -> Result<String> {
        let source = self.api.get_change_source(change.id)?;
        let detail = self.api.get_change_version(change.id)?;
        let tags = self.resolve_tags(change)?;
        let parent = self.resolve_parent(change);

        let page = &change.page_name;
        let format = self.metadata.format();
        let revision_name = detail
            .unix_name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| page.clone());
        let file_name = page_file_name(&revision_name, format);
        let root = self.repo.root().to_path_buf();
        let mut staged = Vec::new();

        let previous_name = self.metadata.names.get(page).cloned();
        let mut message = match previous_name {
            Some(previous) if previous != revision_name => {
                self.progress
                    .report(&format!("Page renamed {previous} -> {revision_name}"));
                staged.extend(self.propagate_parent(page, &previous, &revision_name)?);
                let old_file = page_file_name(&previous, format);
                if root.join(&old_file).is_file() {
                    self.repo.move_path(&old_file, &file_name)?;
                    staged.push(old_file);
                    format!("Renamed from {previous} to {revision_name} ")
                } else {
                    warn!(
                        "event=rename_source_missing module=archiver change={} file={old_file}",
                        change.id
                    );
                    self.progress.report(&format!(
                        "Source file does not exist, probably deleted or renamed already: {old_file}"
                    ));
                    creation_verb(root.join(&file_name).exists()).to_string()
                }
            }
            _ => creation_verb(root.join(&file_name).exists()).to_string(),
        };
        self.metadata
            .names
            .insert(page.clone(), revision_name.clone());
        self.metadata.page_tags.insert(page.clone(), tags.clone());

        let header = PageHeader {
            site: self.metadata.site.clone(),
            page: revision_name.clone(),
            title: detail.title.clone(),
            tags,
            parent,
        };
        let path = root.join(&file_name);
        fs::write(&path, render_page(format, &header, &source))
            .with_context(|| format!("failed to write {}", path.display()))?;
        staged.push(file_name);

        message.push_str(&revision_name);
        if change.comment.is_empty() {
            message.push_str(" (no message)");
        } else {
            message.push_str(": ");
            message.push_str(&change.comment);
        }
        if !detail.images.is_empty() {
            message.push('\n');
        }
        for image in &detail.images {
            if self.failed_images.contains(&image.source_url) {
                debug!(
                    "event=image_known_failed module=archiver url={}",
                    image.source_url
                );
                continue;
            }
            let destination = root.join(&image.target_path);
            if destination.exists() {
                continue;
            }
            match self.api.download_asset(&image.source_url, &destination)? {
                AssetOutcome::Saved => {
                    message.push_str(&format!("\nAdded image: {}", image.source_url));
                    staged.push(image.target_path.clone());
                }
                AssetOutcome::Failed(reason) => {
                    warn!(
                        "event=image_failed module=archiver url={} reason={reason}",
                        image.source_url
                    );
                    if let Err(error) = fs::remove_file(&destination)
                        && destination.exists()
                    {
                        warn!(
                            "event=image_cleanup_failed module=archiver path={} error={error}",
                            destination.display()
                        );
                    }
                    self.store.append_failed_image(&image.source_url)?;
                    self.failed_images.insert(image.source_url.clone());
                }
                AssetOutcome::Skipped(reason) => {
                    warn!(
                        "event=image_skipped module=archiver url={} reason={reason}",
                        image.source_url
                    );
                }
            }
        }

        if self.options.store_rev_ids {
            self.store.write_revid(Some(change.id))?;
            staged.push(REVID_FILE.to_string());
        }
        self.progress
            .report(&format!("Committing: {}. {message}", self.cursor));

        self.store.append_committed(change.id)?;
        self.store.save_metadata(&self.metadata)?;
        staged.push(FETCHED_LOG_FILE.to_string());
        staged.push(METADATA_FILE.to_string());
        self.repo.stage(&staged)?;

        let author = author_signature(change.user.as_deref(), &self.site_host);
        let commit = self.repo.commit(&CommitRequest {
            message,
            author: author.clone(),
            timestamp: Some(change.date),
        })?;
        info!(
            "event=change_committed module=archiver change={} page={} commit={commit} author={}",
            change.id, change.page_name, author.name
        );
        Ok(commit)
    }

    fn resolve_tags(&mut self, change: &Change) -> Result<Vec<String>> {
        let page_changes = self
            .changes
            .iter()
            .filter(|candidate| candidate.page_id == change.page_id);
        let tagged = page_changes
            .clone()
            .filter(|candidate| candidate.is_tag_change())
            .map(|candidate| candidate.id)
            .collect::<Vec<_>>();
        if tagged.is_empty() {
            return self.api.get_live_tags(&change.page_name);
        }
        let other = tagged
            .iter()
            .copied()
            .chain(page_changes.map(|candidate| candidate.id))
            .find(|id| *id != change.id);
        let Some(other) = other else {
            return self.api.get_live_tags(&change.page_name);
        };
        match self.api.get_tag_diff(change.id, other)? {
            Some(tags) => Ok(tags),
            None => match self.metadata.page_tags.get(&change.page_name) {
                Some(tags) => Ok(tags.clone()),
                None => self.api.get_live_tags(&change.page_name),
            },
        }
    }

    fn resolve_parent(&mut self, change: &Change) -> Option<String> {
        match parent_from_comment(&change.comment) {
            Some(parent) if parent.is_empty() => {
                self.metadata.parents.remove(&change.page_name);
                None
            }
            Some(parent) => {
                self.progress.report(&format!("Parent changed {parent}"));
                self.metadata
                    .parents
                    .insert(change.page_name.clone(), parent.clone());
                Some(parent)
            }
            None => self.metadata.parents.get(&change.page_name).cloned(),
        }
    }

    /// Points every child of `old_name` at `new_name`, on disk and in the
    /// parent map. Returns the rewritten files.
    fn propagate_parent(
        &mut self,
        renamed_page: &str,
        old_name: &str,
        new_name: &str,
    ) -> Result<Vec<String>> {
        let children = self
            .metadata
            .parents
            .iter()
            .filter(|(child, parent)| {
                child.as_str() != renamed_page && *parent == old_name && *parent != new_name
            })
            .map(|(child, _)| child.clone())
            .collect::<Vec<_>>();
        if children.is_empty() {
            return Ok(Vec::new());
        }
        self.progress
            .report(&format!("Updating parents for {old_name} {new_name}"));

        let format = self.metadata.format();
        let root = self.repo.root().to_path_buf();
        let mut rewritten = Vec::new();
        for child in children {
            self.metadata
                .parents
                .insert(child.clone(), new_name.to_string());
            let archived_name = self
                .metadata
                .names
                .get(&child)
                .cloned()
                .unwrap_or_else(|| child.clone());
            let file_name = page_file_name(&archived_name, format);
            let path = root.join(&file_name);
            if !path.is_file() {
                warn!("event=child_file_missing module=archiver child={child} file={file_name}");
                self.progress
                    .report(&format!("Failed to find child file! {file_name}"));
                continue;
            }
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            if !format.uses_header() && !has_header(&content) {
                continue;
            }
            let updated = replace_parent_field(&content, old_name, new_name)
                .with_context(|| format!("cannot update child page {child}"))?;
            fs::write(&path, updated)
                .with_context(|| format!("failed to write {}", path.display()))?;
            rewritten.push(file_name);
        }
        Ok(rewritten)
    }

    /// Deletes the state database after a completed run.
    pub fn cleanup(self) -> Result<()> {
        self.progress.report("Removing archive state database");
        self.store.cleanup()
    }
}

fn creation_verb(file_exists: bool) -> &'static str {
    if file_exists { "Updated " } else { "Created " }
}

/// Parent named by a parent-assignment comment; empty when it was cleared.
pub fn parent_from_comment(comment: &str) -> Option<String> {
    let rest = comment.strip_prefix(PARENT_COMMENT_PREFIX)?;
    let name = rest
        .strip_suffix("\".")
        .or_else(|| rest.strip_suffix('"'))
        .unwrap_or(rest);
    Some(name.to_string())
}

pub fn author_signature(user: Option<&str>, site_host: &str) -> Signature {
    let name = user
        .map(str::trim)
        .filter(|user| !user.is_empty())
        .unwrap_or(UNKNOWN_USER)
        .to_string();
    let mut local = name
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '.' | '+'))
        .collect::<String>()
        .to_ascii_lowercase();
    if local.is_empty() {
        local = UNKNOWN_USER.to_string();
    }
    Signature {
        email: format!("{local}@{site_host}"),
        name,
    }
}

fn create_initial_commit<V: VersionStore>(
    repo: &mut V,
    store: &ArchiveStore,
    store_rev_ids: bool,
) -> Result<()> {
    if !store.fetched_log_path().exists() {
        store.write_fetched_log("")?;
    }
    let mut staged = vec![FETCHED_LOG_FILE.to_string()];
    if store_rev_ids {
        store.write_revid(None)?;
        staged.push(REVID_FILE.to_string());
    }
    repo.stage(&staged)?;
    let commit = repo.commit(&CommitRequest {
        message: INITIAL_COMMIT_MESSAGE.to_string(),
        author: Signature::tool(),
        timestamp: None,
    })?;
    info!("event=repository_created module=archiver commit={commit}");
    Ok(())
}

/// Brings the working copy back to the head commit. A committed-id log that
/// runs ahead of the head means a change was interrupted mid-commit; it is
/// rolled back here and replayed by the next step.
fn recover_working_copy<V: VersionStore>(
    repo: &mut V,
    store: &ArchiveStore,
    progress: &dyn ProgressSink,
) -> Result<()> {
    let working = store.read_fetched_log()?;
    let recorded = repo.read_committed(FETCHED_LOG_FILE)?.unwrap_or_default();
    if working.len() > recorded.len() && working.starts_with(&recorded) {
        warn!(
            "event=partial_commit_recovered module=archiver pending_ids={}",
            working[recorded.len()..].lines().count()
        );
        progress.report("Recovering from an interrupted commit");
    }
    repo.restore_head(&RECOVERY_SCOPE)
}
