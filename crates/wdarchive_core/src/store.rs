use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::model::{Change, ChangeFlag, PageFormat, Selector};

pub const STATE_DIR: &str = ".wdarchive";
pub const STATE_DB_FILE: &str = "state.db";
pub const FETCHED_LOG_FILE: &str = ".fetched.txt";
pub const METADATA_FILE: &str = ".metadata.json";
pub const METADATA_TEMP_FILE: &str = ".metadata.json.tmp";
pub const FAILED_IMAGES_FILE: &str = ".failed-images.txt";
pub const REVID_FILE: &str = ".revid";
pub const IMAGES_DIR: &str = "images";

const CURSOR_KEY: &str = "cursor";

const STATE_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS changes (
    seq INTEGER PRIMARY KEY,
    change_id INTEGER NOT NULL UNIQUE,
    page_id INTEGER NOT NULL,
    page_name TEXT NOT NULL,
    flag TEXT,
    date INTEGER NOT NULL,
    user TEXT,
    comment TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS pages (
    position INTEGER PRIMARY KEY,
    name TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS run_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

/// Snapshot of reconciliation state, committed with every change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveMetadata {
    pub site: String,
    pub category: String,
    pub tags: Option<String>,
    pub created_by: Option<String>,
    /// Current page name -> name it was last archived under.
    pub names: BTreeMap<String, String>,
    /// Current page name -> last archived parent name.
    pub parents: BTreeMap<String, String>,
    /// Current page name -> tags written by the last commit of that page.
    pub page_tags: BTreeMap<String, Vec<String>>,
    pub use_ftml: bool,
}

impl Default for ArchiveMetadata {
    fn default() -> Self {
        Self {
            site: String::new(),
            category: ".".to_string(),
            tags: None,
            created_by: None,
            names: BTreeMap::new(),
            parents: BTreeMap::new(),
            page_tags: BTreeMap::new(),
            use_ftml: true,
        }
    }
}

impl ArchiveMetadata {
    pub fn new(selector: &Selector, format: PageFormat) -> Self {
        let mut metadata = Self::default();
        metadata.set_selector(selector);
        metadata.use_ftml = format == PageFormat::New;
        metadata
    }

    pub fn selector(&self) -> Selector {
        Selector {
            category: self.category.clone(),
            tags: self.tags.clone(),
            created_by: self.created_by.clone(),
        }
    }

    pub fn set_selector(&mut self, selector: &Selector) {
        self.category = selector.category.clone();
        self.tags = selector.tags.clone();
        self.created_by = selector.created_by.clone();
    }

    pub fn format(&self) -> PageFormat {
        PageFormat::from_flag(self.use_ftml)
    }
}

/// Durable run state for one archive directory.
///
/// The change list, page list and cursor live in a SQLite file under
/// `.wdarchive/`; the committed-id log, metadata snapshot and failed-asset
/// list are flat files at the archive root so they can be versioned.
pub struct ArchiveStore {
    root: PathBuf,
    db_path: PathBuf,
    connection: Connection,
}

impl ArchiveStore {
    pub fn open(root: &Path) -> Result<Self> {
        let state_dir = root.join(STATE_DIR);
        fs::create_dir_all(&state_dir)
            .with_context(|| format!("failed to create {}", state_dir.display()))?;
        let db_path = state_dir.join(STATE_DB_FILE);
        let connection = open_state_connection(&db_path)?;
        connection
            .execute_batch(STATE_SCHEMA_SQL)
            .context("failed to initialize archive state schema")?;
        Ok(Self {
            root: root.to_path_buf(),
            db_path,
            connection,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn load_changes(&self) -> Result<Vec<Change>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT change_id, page_id, page_name, flag, date, user, comment
                 FROM changes ORDER BY seq ASC",
            )
            .context("failed to prepare change list query")?;
        let rows = statement
            .query_map([], |row| {
                Ok(Change {
                    id: row.get(0)?,
                    page_id: row.get(1)?,
                    page_name: row.get(2)?,
                    flag: row.get::<_, Option<String>>(3)?.map(ChangeFlag::from),
                    date: row.get(4)?,
                    user: row.get(5)?,
                    comment: row.get(6)?,
                })
            })
            .context("failed to query change list")?;
        let mut changes = Vec::new();
        for row in rows {
            changes.push(row.context("failed to decode change row")?);
        }
        Ok(changes)
    }

    /// Appends changes not yet in the list; returns how many were new.
    pub fn extend_changes(&mut self, changes: &[Change]) -> Result<usize> {
        let transaction = self
            .connection
            .transaction()
            .context("failed to start change list transaction")?;
        let mut inserted = 0usize;
        {
            let mut statement = transaction
                .prepare(
                    "INSERT OR IGNORE INTO changes
                        (change_id, page_id, page_name, flag, date, user, comment)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )
                .context("failed to prepare change insert")?;
            for change in changes {
                inserted += statement
                    .execute(params![
                        change.id,
                        change.page_id,
                        change.page_name,
                        change.flag.as_ref().map(ChangeFlag::as_str),
                        change.date,
                        change.user,
                        change.comment,
                    ])
                    .with_context(|| format!("failed to insert change {}", change.id))?;
            }
        }
        transaction
            .commit()
            .context("failed to commit change list transaction")?;
        Ok(inserted)
    }

    /// Replaces the whole list, keeping the given order.
    pub fn save_changes(&mut self, changes: &[Change]) -> Result<()> {
        let transaction = self
            .connection
            .transaction()
            .context("failed to start change list transaction")?;
        transaction
            .execute("DELETE FROM changes", [])
            .context("failed to clear change list")?;
        {
            let mut statement = transaction
                .prepare(
                    "INSERT INTO changes
                        (seq, change_id, page_id, page_name, flag, date, user, comment)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )
                .context("failed to prepare change insert")?;
            for (seq, change) in changes.iter().enumerate() {
                statement
                    .execute(params![
                        i64::try_from(seq).context("change list too long")?,
                        change.id,
                        change.page_id,
                        change.page_name,
                        change.flag.as_ref().map(ChangeFlag::as_str),
                        change.date,
                        change.user,
                        change.comment,
                    ])
                    .with_context(|| format!("failed to insert change {}", change.id))?;
            }
        }
        transaction
            .commit()
            .context("failed to commit change list transaction")
    }

    pub fn load_pages(&self) -> Result<Vec<String>> {
        let mut statement = self
            .connection
            .prepare("SELECT name FROM pages ORDER BY position ASC")
            .context("failed to prepare page list query")?;
        let rows = statement
            .query_map([], |row| row.get::<_, String>(0))
            .context("failed to query page list")?;
        let mut pages = Vec::new();
        for row in rows {
            pages.push(row.context("failed to decode page row")?);
        }
        Ok(pages)
    }

    pub fn save_pages(&mut self, pages: &[String]) -> Result<()> {
        let transaction = self
            .connection
            .transaction()
            .context("failed to start page list transaction")?;
        transaction
            .execute("DELETE FROM pages", [])
            .context("failed to clear page list")?;
        {
            let mut statement = transaction
                .prepare("INSERT INTO pages (position, name) VALUES (?1, ?2)")
                .context("failed to prepare page insert")?;
            for (position, name) in pages.iter().enumerate() {
                statement
                    .execute(params![
                        i64::try_from(position).context("page list too long")?,
                        name
                    ])
                    .with_context(|| format!("failed to insert page {name}"))?;
            }
        }
        transaction
            .commit()
            .context("failed to commit page list transaction")
    }

    pub fn load_cursor(&self) -> Result<usize> {
        let value: Option<String> = self
            .connection
            .query_row(
                "SELECT value FROM run_state WHERE key = ?1",
                [CURSOR_KEY],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read cursor")?;
        match value {
            Some(value) => value
                .parse::<usize>()
                .with_context(|| format!("corrupt cursor value: {value}")),
            None => Ok(0),
        }
    }

    pub fn save_cursor(&self, cursor: usize) -> Result<()> {
        self.connection
            .execute(
                "INSERT INTO run_state (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![CURSOR_KEY, cursor.to_string()],
            )
            .context("failed to persist cursor")?;
        Ok(())
    }

    pub fn fetched_log_path(&self) -> PathBuf {
        self.root.join(FETCHED_LOG_FILE)
    }

    /// Raw committed-id log; empty when the file does not exist yet.
    pub fn read_fetched_log(&self) -> Result<String> {
        let path = self.fetched_log_path();
        if !path.exists() {
            return Ok(String::new());
        }
        fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))
    }

    pub fn write_fetched_log(&self, content: &str) -> Result<()> {
        let path = self.fetched_log_path();
        fs::write(&path, content).with_context(|| format!("failed to write {}", path.display()))
    }

    /// Committed change ids in write order.
    pub fn load_committed(&self) -> Result<Vec<i64>> {
        parse_fetched_log(&self.read_fetched_log()?)
    }

    pub fn append_committed(&self, change_id: i64) -> Result<()> {
        let path = self.fetched_log_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        writeln!(file, "{change_id}")
            .with_context(|| format!("failed to append to {}", path.display()))?;
        file.sync_data()
            .with_context(|| format!("failed to sync {}", path.display()))
    }

    pub fn load_metadata(&self) -> Result<Option<ArchiveMetadata>> {
        let path = self.root.join(METADATA_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw =
            fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
        parse_metadata(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))
            .map(Some)
    }

    pub fn save_metadata(&self, metadata: &ArchiveMetadata) -> Result<()> {
        let path = self.root.join(METADATA_FILE);
        let temp_path = self.root.join(METADATA_TEMP_FILE);
        let encoded =
            serde_json::to_string_pretty(metadata).context("failed to encode archive metadata")?;
        fs::write(&temp_path, format!("{encoded}\n"))
            .with_context(|| format!("failed to write {}", temp_path.display()))?;
        fs::rename(&temp_path, &path)
            .with_context(|| format!("failed to replace {}", path.display()))
    }

    pub fn load_failed_images(&self) -> Result<BTreeSet<String>> {
        let path = self.root.join(FAILED_IMAGES_FILE);
        if !path.exists() {
            return Ok(BTreeSet::new());
        }
        let raw =
            fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
        Ok(raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToString::to_string)
            .collect())
    }

    pub fn append_failed_image(&self, url: &str) -> Result<()> {
        let path = self.root.join(FAILED_IMAGES_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        writeln!(file, "{url}").with_context(|| format!("failed to append to {}", path.display()))
    }

    pub fn write_revid(&self, change_id: Option<i64>) -> Result<()> {
        let path = self.root.join(REVID_FILE);
        let content = change_id.map(|id| id.to_string()).unwrap_or_default();
        fs::write(&path, content).with_context(|| format!("failed to write {}", path.display()))
    }

    /// Deletes the state database; versioned files stay.
    pub fn cleanup(self) -> Result<()> {
        let Self {
            db_path,
            connection,
            ..
        } = self;
        connection
            .close()
            .map_err(|(_, error)| error)
            .context("failed to close archive state database")?;
        for suffix in ["", "-wal", "-shm"] {
            let path = PathBuf::from(format!("{}{suffix}", db_path.display()));
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to remove {}", path.display()))?;
            }
        }
        if let Some(state_dir) = db_path.parent()
            && fs::read_dir(state_dir)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false)
        {
            fs::remove_dir(state_dir)
                .with_context(|| format!("failed to remove {}", state_dir.display()))?;
        }
        Ok(())
    }
}

pub fn parse_fetched_log(raw: &str) -> Result<Vec<i64>> {
    let mut ids = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(id) = line.parse::<i64>() else {
            bail!("corrupt committed-id log at line {}: {line}", index + 1);
        };
        ids.push(id);
    }
    Ok(ids)
}

pub fn parse_metadata(raw: &str) -> Result<ArchiveMetadata> {
    serde_json::from_str(raw).context("invalid metadata JSON")
}

fn open_state_connection(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    Ok(connection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn change(id: i64, date: i64) -> Change {
        Change {
            id,
            page_id: 7,
            page_name: "alpha".to_string(),
            flag: Some(ChangeFlag::Source),
            date,
            user: Some("editor".to_string()),
            comment: String::new(),
        }
    }

    #[test]
    fn change_list_extends_without_duplicates_and_reloads_in_order() {
        let temp = tempdir().expect("tempdir");
        let mut store = ArchiveStore::open(temp.path()).expect("open store");
        assert_eq!(store.extend_changes(&[change(3, 30), change(1, 10)]).expect("extend"), 2);
        assert_eq!(store.extend_changes(&[change(1, 10), change(2, 20)]).expect("extend"), 1);
        let ids = store
            .load_changes()
            .expect("load")
            .iter()
            .map(|change| change.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![3, 1, 2]);

        let mut sorted = store.load_changes().expect("load");
        sorted.sort_by_key(|change| (change.date, change.id));
        store.save_changes(&sorted).expect("save");
        drop(store);

        let reopened = ArchiveStore::open(temp.path()).expect("reopen");
        let reloaded = reopened.load_changes().expect("load");
        assert_eq!(reloaded.iter().map(|c| c.id).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(reloaded[0].flag, Some(ChangeFlag::Source));
    }

    #[test]
    fn cursor_and_pages_survive_reopen() {
        let temp = tempdir().expect("tempdir");
        let mut store = ArchiveStore::open(temp.path()).expect("open store");
        assert_eq!(store.load_cursor().expect("cursor"), 0);
        store.save_cursor(4).expect("save cursor");
        store.save_cursor(5).expect("save cursor");
        store
            .save_pages(&["b".to_string(), "a".to_string()])
            .expect("save pages");
        drop(store);

        let store = ArchiveStore::open(temp.path()).expect("reopen");
        assert_eq!(store.load_cursor().expect("cursor"), 5);
        assert_eq!(store.load_pages().expect("pages"), vec!["b", "a"]);
    }

    #[test]
    fn committed_log_appends_one_id_per_line() {
        let temp = tempdir().expect("tempdir");
        let store = ArchiveStore::open(temp.path()).expect("open store");
        assert!(store.load_committed().expect("load").is_empty());
        store.append_committed(11).expect("append");
        store.append_committed(12).expect("append");
        assert_eq!(store.read_fetched_log().expect("read"), "11\n12\n");
        assert_eq!(store.load_committed().expect("load"), vec![11, 12]);
    }

    #[test]
    fn corrupt_committed_log_is_fatal() {
        assert!(parse_fetched_log("1\nnot-a-number\n").is_err());
    }

    #[test]
    fn metadata_uses_stable_key_names() {
        let temp = tempdir().expect("tempdir");
        let store = ArchiveStore::open(temp.path()).expect("open store");
        assert!(store.load_metadata().expect("load").is_none());

        let mut metadata = ArchiveMetadata::new(&Selector::default(), PageFormat::Legacy);
        metadata.names.insert("b".to_string(), "a".to_string());
        metadata.parents.insert("c".to_string(), "b".to_string());
        store.save_metadata(&metadata).expect("save");

        let raw = fs::read_to_string(temp.path().join(METADATA_FILE)).expect("read");
        for key in ["\"category\"", "\"names\"", "\"parents\"", "\"use_ftml\"", "\"created_by\""] {
            assert!(raw.contains(key), "missing {key}");
        }
        assert_eq!(store.load_metadata().expect("load"), Some(metadata));
    }

    #[test]
    fn metadata_without_newer_keys_still_loads() {
        let metadata = parse_metadata(
            r#"{"category": "scp", "tags": null, "created_by": null, "names": {}, "parents": {}, "use_ftml": false}"#,
        )
        .expect("parse");
        assert_eq!(metadata.category, "scp");
        assert!(metadata.page_tags.is_empty());
        assert_eq!(metadata.format(), PageFormat::Legacy);
    }

    #[test]
    fn cleanup_removes_only_the_state_database() {
        let temp = tempdir().expect("tempdir");
        let store = ArchiveStore::open(temp.path()).expect("open store");
        store.append_committed(1).expect("append");
        store.append_failed_image("http://x/y.png").expect("append");
        store.cleanup().expect("cleanup");

        assert!(!temp.path().join(STATE_DIR).join(STATE_DB_FILE).exists());
        assert!(temp.path().join(FETCHED_LOG_FILE).exists());
        let store = ArchiveStore::open(temp.path()).expect("reopen");
        assert!(store.load_changes().expect("load").is_empty());
        assert!(store.load_failed_images().expect("load").contains("http://x/y.png"));
    }
}
