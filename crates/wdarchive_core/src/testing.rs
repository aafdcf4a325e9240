//! In-memory stand-ins for the remote wiki and the versioned target.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Result, anyhow, bail};
use walkdir::WalkDir;

use crate::client::{AssetOutcome, WikidotApi};
use crate::model::{
    ChangeFlag, ImageReference, Ratings, RevisionEntry, Selector, VersionDetail,
};
use crate::progress::ProgressSink;
use crate::vcs::{CleanScope, CommitRequest, Signature, VersionStore};

pub const MOCK_SITE: &str = "http://test.wikidot.com";
pub const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nmock";

pub fn revision(id: i64, date: i64, flag: &str, user: &str, comment: &str) -> RevisionEntry {
    RevisionEntry {
        id,
        flag: Some(ChangeFlag::parse(flag)),
        date,
        user: Some(user.to_string()),
        comment: comment.to_string(),
        attached_file: flag == "F",
    }
}

#[derive(Debug, Clone)]
struct MockVersion {
    unix_name: Option<String>,
    title: Option<String>,
    images: Vec<ImageReference>,
}

#[derive(Debug, Default)]
pub struct MockApi {
    pub listing: Vec<String>,
    pub page_ids: HashMap<String, i64>,
    /// Newest first, the way the history module reports rows.
    pub history: HashMap<i64, Vec<RevisionEntry>>,
    sources: HashMap<i64, String>,
    versions: HashMap<i64, MockVersion>,
    pub live_tags: HashMap<String, Vec<String>>,
    pub tag_diffs: HashMap<(i64, i64), Vec<String>>,
    pub ratings: HashMap<i64, Ratings>,
    pub assets: HashMap<String, AssetOutcome>,
    pub failing_sources: HashSet<i64>,
    pub failing_page_ids: HashSet<String>,
    pub calls: Vec<String>,
    requests: usize,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_page(&mut self, name: &str, page_id: i64) {
        self.listing.push(name.to_string());
        self.page_ids.insert(name.to_string(), page_id);
    }

    /// Records a revision as it appeared at revision time.
    pub fn add_revision(
        &mut self,
        page_id: i64,
        entry: RevisionEntry,
        unix_name: &str,
        source: &str,
    ) {
        self.sources.insert(entry.id, source.to_string());
        self.versions.insert(
            entry.id,
            MockVersion {
                unix_name: Some(unix_name.to_string()),
                title: None,
                images: Vec::new(),
            },
        );
        self.history.entry(page_id).or_default().insert(0, entry);
    }

    pub fn set_title(&mut self, change_id: i64, title: &str) {
        if let Some(version) = self.versions.get_mut(&change_id) {
            version.title = Some(title.to_string());
        }
    }

    pub fn add_image(&mut self, change_id: i64, source_url: &str, target_path: &str) {
        if let Some(version) = self.versions.get_mut(&change_id) {
            version.images.push(ImageReference {
                source_url: source_url.to_string(),
                display_name: target_path.rsplit('/').next().unwrap_or_default().to_string(),
                target_path: target_path.to_string(),
            });
        }
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls.iter().filter(|call| call.starts_with(prefix)).count()
    }

    fn record(&mut self, call: String) {
        self.requests += 1;
        self.calls.push(call);
    }
}

impl WikidotApi for MockApi {
    fn list_pages(&mut self, _selector: &Selector, limit: usize) -> Result<Vec<String>> {
        self.record("list_pages".to_string());
        Ok(self.listing.iter().take(limit).cloned().collect())
    }

    fn get_page_id(&mut self, unix_name: &str) -> Result<Option<i64>> {
        self.record(format!("get_page_id {unix_name}"));
        if self.failing_page_ids.contains(unix_name) {
            bail!("page lookup failed for {unix_name}");
        }
        Ok(self.page_ids.get(unix_name).copied())
    }

    fn get_changes(&mut self, page_id: i64, limit: usize) -> Result<Vec<RevisionEntry>> {
        self.record(format!("get_changes {page_id}"));
        Ok(self
            .history
            .get(&page_id)
            .map(|rows| rows.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    fn get_change_source(&mut self, change_id: i64) -> Result<String> {
        self.record(format!("get_change_source {change_id}"));
        if self.failing_sources.contains(&change_id) {
            bail!("source request for {change_id} failed after 5 attempts");
        }
        self.sources
            .get(&change_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown change {change_id}"))
    }

    fn get_change_version(&mut self, change_id: i64) -> Result<VersionDetail> {
        self.record(format!("get_change_version {change_id}"));
        let version = self
            .versions
            .get(&change_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown change {change_id}"))?;
        Ok(VersionDetail {
            change_id,
            unix_name: version.unix_name,
            title: version.title,
            rendered_content: String::new(),
            images: version.images,
        })
    }

    fn get_live_tags(&mut self, unix_name: &str) -> Result<Vec<String>> {
        self.record(format!("get_live_tags {unix_name}"));
        Ok(self.live_tags.get(unix_name).cloned().unwrap_or_default())
    }

    fn get_tag_diff(&mut self, from_id: i64, to_id: i64) -> Result<Option<Vec<String>>> {
        self.record(format!("get_tag_diff {from_id} {to_id}"));
        Ok(self.tag_diffs.get(&(from_id, to_id)).cloned())
    }

    fn get_ratings(&mut self, page_id: i64) -> Result<Ratings> {
        self.record(format!("get_ratings {page_id}"));
        Ok(self.ratings.get(&page_id).cloned().unwrap_or_default())
    }

    fn download_asset(&mut self, url: &str, destination: &Path) -> Result<AssetOutcome> {
        self.record(format!("download_asset {url}"));
        let outcome = self
            .assets
            .get(url)
            .cloned()
            .unwrap_or_else(|| AssetOutcome::Failed("HTTP 404 Not Found".to_string()));
        if outcome == AssetOutcome::Saved {
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(destination, PNG_BYTES)?;
        }
        Ok(outcome)
    }

    fn site_url(&self) -> &str {
        MOCK_SITE
    }

    fn request_count(&self) -> usize {
        self.requests
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommit {
    pub id: String,
    pub message: String,
    pub author: Signature,
    pub timestamp: Option<i64>,
    pub changed: BTreeSet<String>,
}

/// Versioned store over a real directory with history kept in memory.
#[derive(Debug)]
pub struct MemoryRepository {
    root: PathBuf,
    head: BTreeMap<String, Vec<u8>>,
    staged: BTreeSet<String>,
    pub commits: Vec<RecordedCommit>,
    /// When set, `commit` fails before recording anything.
    pub fail_commits: bool,
}

impl MemoryRepository {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            head: BTreeMap::new(),
            staged: BTreeSet::new(),
            commits: Vec::new(),
            fail_commits: false,
        }
    }

    pub fn head_files(&self) -> BTreeMap<String, String> {
        self.head
            .iter()
            .map(|(path, bytes)| (path.clone(), String::from_utf8_lossy(bytes).to_string()))
            .collect()
    }

    pub fn messages(&self) -> Vec<String> {
        self.commits.iter().map(|commit| commit.message.clone()).collect()
    }

    fn files_under(&self, relative: &str) -> Vec<String> {
        let base = self.root.join(relative);
        if base.is_file() {
            return vec![relative.to_string()];
        }
        WalkDir::new(&base)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                entry
                    .path()
                    .strip_prefix(&self.root)
                    .ok()
                    .map(|path| path.to_string_lossy().replace('\\', "/"))
            })
            .collect()
    }
}

impl VersionStore for MemoryRepository {
    fn root(&self) -> &Path {
        &self.root
    }

    fn has_commits(&self) -> Result<bool> {
        Ok(!self.commits.is_empty())
    }

    fn move_path(&mut self, from: &str, to: &str) -> Result<()> {
        fs::rename(self.root.join(from), self.root.join(to))?;
        self.staged.insert(from.to_string());
        self.staged.insert(to.to_string());
        Ok(())
    }

    fn stage(&mut self, paths: &[String]) -> Result<()> {
        for path in paths {
            let prefix = format!("{path}/");
            let tracked = self
                .head
                .keys()
                .filter(|key| key.starts_with(&prefix))
                .cloned()
                .collect::<Vec<_>>();
            self.staged.extend(tracked);
            self.staged.extend(self.files_under(path));
            self.staged.insert(path.clone());
        }
        Ok(())
    }

    fn commit(&mut self, request: &CommitRequest) -> Result<String> {
        if self.fail_commits {
            bail!("simulated crash before commit");
        }
        let mut changed = BTreeSet::new();
        for path in std::mem::take(&mut self.staged) {
            let full = self.root.join(&path);
            if full.is_dir() {
                continue;
            }
            if full.is_file() {
                let bytes = fs::read(&full)?;
                if self.head.get(&path) != Some(&bytes) {
                    self.head.insert(path.clone(), bytes);
                    changed.insert(path);
                }
            } else if self.head.remove(&path).is_some() {
                changed.insert(path);
            }
        }
        let id = format!("commit-{}", self.commits.len() + 1);
        self.commits.push(RecordedCommit {
            id: id.clone(),
            message: request.message.clone(),
            author: request.author.clone(),
            timestamp: request.timestamp,
            changed,
        });
        Ok(id)
    }

    fn read_committed(&self, path: &str) -> Result<Option<String>> {
        Ok(self
            .head
            .get(path)
            .map(|bytes| String::from_utf8_lossy(bytes).to_string()))
    }

    fn restore_head(&mut self, scope: &CleanScope<'_>) -> Result<()> {
        self.staged.clear();
        for file in self.files_under("") {
            if scope.contains(&file) && !self.head.contains_key(&file) {
                fs::remove_file(self.root.join(&file))?;
            }
        }
        for (path, bytes) in &self.head {
            let full = self.root.join(path);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(full, bytes)?;
        }
        Ok(())
    }
}

/// Progress sink that keeps every line for assertions.
#[derive(Debug, Clone, Default)]
pub struct RecordingProgress {
    lines: Rc<RefCell<Vec<String>>>,
}

impl RecordingProgress {
    pub fn lines(&self) -> Vec<String> {
        self.lines.borrow().clone()
    }
}

impl ProgressSink for RecordingProgress {
    fn report(&self, message: &str) {
        self.lines.borrow_mut().push(message.to_string());
    }
}
