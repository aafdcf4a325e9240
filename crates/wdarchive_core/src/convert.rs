use std::fs;

use anyhow::{Context, Result};
use log::info;
use walkdir::WalkDir;

use crate::model::{PageFormat, restore_unix_name};
use crate::page_file::{PageHeader, wrap_legacy_header};
use crate::progress::ProgressSink;
use crate::store::{ArchiveMetadata, ArchiveStore, METADATA_FILE};
use crate::vcs::{CommitRequest, Signature, VersionStore};

pub fn conversion_message(from: PageFormat, to: PageFormat) -> String {
    format!("Convert from {from} to {to}")
}

/// Moves every page file to the `target` format in a single commit.
///
/// Nothing happens when the archive already records `target`. Pages that
/// already exist under the target extension are left alone; legacy pages
/// gain a header when converted to the new format, while the reverse
/// direction only renames.
pub fn convert_archive<V: VersionStore>(
    repo: &mut V,
    store: &ArchiveStore,
    metadata: &mut ArchiveMetadata,
    target: PageFormat,
    progress: &dyn ProgressSink,
) -> Result<Option<String>> {
    let source = metadata.format();
    if source == target {
        return Ok(None);
    }

    let root = repo.root().to_path_buf();
    let mut stems = Vec::new();
    for entry in WalkDir::new(&root).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to list {}", root.display()))?;
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if hidden
            || !entry.file_type().is_file()
            || path.extension().and_then(|ext| ext.to_str()) != Some(source.extension())
        {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
            stems.push(stem.to_string());
        }
    }

    let mut staged = Vec::new();
    let total = stems.len();
    for (index, stem) in stems.iter().enumerate() {
        progress.report(&format!("Converting format: {}/{total}", index + 1));
        let from = format!("{stem}.{}", source.extension());
        let to = format!("{stem}.{}", target.extension());
        if root.join(&to).exists() {
            continue;
        }
        if target.uses_header() {
            let path = root.join(&from);
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let header = fallback_header(metadata, &restore_unix_name(stem));
            if let Some(wrapped) = wrap_legacy_header(&content, &header) {
                fs::write(&path, wrapped)
                    .with_context(|| format!("failed to write {}", path.display()))?;
            }
        }
        repo.move_path(&from, &to)?;
        staged.push(from);
        staged.push(to);
    }

    metadata.use_ftml = target == PageFormat::New;
    store.save_metadata(metadata)?;
    staged.push(METADATA_FILE.to_string());
    repo.stage(&staged)?;
    let commit = repo.commit(&CommitRequest {
        message: conversion_message(source, target),
        author: Signature::tool(),
        timestamp: None,
    })?;
    info!(
        "event=format_converted module=convert from={source} to={target} pages={} commit={commit}",
        staged.len().saturating_sub(1) / 2
    );
    progress.report(&format!("Committed {commit} for format conversion"));
    Ok(Some(commit))
}

/// Header for a legacy page that carries no metadata lines of its own.
fn fallback_header(metadata: &ArchiveMetadata, archived_name: &str) -> PageHeader {
    let current_name = metadata
        .names
        .iter()
        .find(|(_, archived)| archived.as_str() == archived_name)
        .map(|(current, _)| current.clone())
        .unwrap_or_else(|| archived_name.to_string());
    PageHeader {
        site: metadata.site.clone(),
        page: archived_name.to_string(),
        title: None,
        tags: metadata
            .page_tags
            .get(&current_name)
            .cloned()
            .unwrap_or_default(),
        parent: metadata.parents.get(&current_name).cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Selector;
    use crate::progress::SilentProgress;
    use crate::testing::MemoryRepository;
    use tempfile::tempdir;

    fn legacy_metadata() -> ArchiveMetadata {
        let mut metadata = ArchiveMetadata::new(&Selector::default(), PageFormat::Legacy);
        metadata.site = "http://test.wikidot.com".to_string();
        metadata
            .names
            .insert("hub".to_string(), "old-hub".to_string());
        metadata
            .page_tags
            .insert("hub".to_string(), vec!["hub".to_string()]);
        metadata
            .parents
            .insert("hub".to_string(), "root".to_string());
        metadata
    }

    #[test]
    fn legacy_pages_move_to_the_new_format_in_one_commit() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        let store = ArchiveStore::open(root).expect("store");
        let mut repo = MemoryRepository::new(root);
        fs::write(root.join("old-hub.txt"), "hub body").expect("write");
        fs::write(root.join("fragment~a.txt"), "title:A\nfragment").expect("write");
        fs::write(root.join("notes.md"), "ignored").expect("write");
        fs::write(root.join(".fetched.txt"), "1\n").expect("write");
        repo.stage(&["old-hub.txt".to_string(), "fragment~a.txt".to_string()])
            .expect("stage");
        repo.commit(&CommitRequest {
            message: "seed".to_string(),
            author: Signature::tool(),
            timestamp: None,
        })
        .expect("seed commit");

        let mut metadata = legacy_metadata();
        let commit = convert_archive(&mut repo, &store, &mut metadata, PageFormat::New, &SilentProgress)
            .expect("convert");
        assert!(commit.is_some());
        assert!(metadata.use_ftml);
        assert_eq!(
            fs::read_to_string(root.join("old-hub.ftml")).expect("read"),
            "---\nsite: http://test.wikidot.com\npage: old-hub\ntags: hub\nparent: root\n---\nhub body"
        );
        assert_eq!(
            fs::read_to_string(root.join("fragment~a.ftml")).expect("read"),
            "---\ntitle: A\n---\nfragment"
        );
        assert!(!root.join("old-hub.txt").exists());
        assert!(root.join("notes.md").exists());
        assert!(root.join(".fetched.txt").exists());

        let last = repo.commits.last().expect("commit");
        assert_eq!(last.message, "Convert from txt to ftml");
        assert!(last.changed.contains("old-hub.txt"));
        assert!(last.changed.contains("fragment~a.ftml"));
        assert!(last.changed.contains(METADATA_FILE));
    }

    #[test]
    fn converting_to_the_recorded_format_is_a_no_op() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        let store = ArchiveStore::open(root).expect("store");
        let mut repo = MemoryRepository::new(root);
        fs::write(root.join("page.ftml"), "---\nsite: x\npage: page\n---\n").expect("write");
        let mut metadata = ArchiveMetadata::new(&Selector::default(), PageFormat::New);
        let before = metadata.clone();

        let commit = convert_archive(&mut repo, &store, &mut metadata, PageFormat::New, &SilentProgress)
            .expect("convert");
        assert_eq!(commit, None);
        assert!(repo.commits.is_empty());
        assert_eq!(metadata, before);
        assert!(!root.join(METADATA_FILE).exists());
    }

    #[test]
    fn new_to_legacy_only_renames() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        let store = ArchiveStore::open(root).expect("store");
        let mut repo = MemoryRepository::new(root);
        let content = "---\nsite: x\npage: page\n---\nbody";
        fs::write(root.join("page.ftml"), content).expect("write");
        let mut metadata = ArchiveMetadata::new(&Selector::default(), PageFormat::New);

        convert_archive(&mut repo, &store, &mut metadata, PageFormat::Legacy, &SilentProgress)
            .expect("convert");
        assert_eq!(fs::read_to_string(root.join("page.txt")).expect("read"), content);
        assert_eq!(repo.messages(), vec!["Convert from ftml to txt".to_string()]);
        assert_eq!(metadata.format(), PageFormat::Legacy);
    }
}
