use std::collections::HashSet;

use anyhow::Result;
use log::{debug, info, warn};

use crate::client::WikidotApi;
use crate::model::{Change, Selector};
use crate::progress::ProgressSink;
use crate::store::ArchiveStore;

#[derive(Debug, Clone)]
pub struct CompileRequest {
    /// When non-empty, replaces the selector-driven page listing.
    pub pages: Vec<String>,
    pub selector: Selector,
    /// Most recent changes fetched per page.
    pub depth: usize,
    pub max_page_count: usize,
    pub ignored_pages: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileSummary {
    pub page_count: usize,
    pub queried_pages: usize,
    pub missing_pages: usize,
    pub added_changes: usize,
    pub total_changes: usize,
}

/// Orders the change list; equal timestamps fall back to the change id.
pub fn sort_changes(changes: &mut [Change]) {
    changes.sort_by_key(|change| (change.date, change.id));
}

/// Extends the cached change list with every uncommitted change of pages not
/// yet represented in it, then sorts and persists the result.
pub fn compile_changes(
    api: &mut dyn WikidotApi,
    store: &mut ArchiveStore,
    committed: &HashSet<i64>,
    request: &CompileRequest,
    progress: &dyn ProgressSink,
) -> Result<(Vec<Change>, CompileSummary)> {
    let mut changes = store.load_changes()?;
    if !changes.is_empty() {
        progress.report(&format!("Loaded cached revision list: {} changes", changes.len()));
    }
    progress.report(&format!("{} revisions already fetched", committed.len()));

    let pages = resolve_pages(api, store, request, progress)?;
    let represented = changes
        .iter()
        .map(|change| change.page_name.clone())
        .collect::<HashSet<_>>();
    let mut known_ids = changes.iter().map(|change| change.id).collect::<HashSet<_>>();
    let mut summary = CompileSummary {
        page_count: pages.len(),
        ..CompileSummary::default()
    };

    for (index, page) in pages.iter().enumerate() {
        if represented.contains(page) {
            continue;
        }
        if request.ignored_pages.iter().any(|ignored| ignored == page) {
            debug!("event=page_ignored module=compile page={page}");
            continue;
        }
        progress.report(&format!(
            "Updating list of revisions to fetch: {}/{}",
            index + 1,
            pages.len()
        ));
        summary.queried_pages += 1;

        let page_id = match api.get_page_id(page) {
            Ok(Some(page_id)) => page_id,
            Ok(None) => {
                warn!("event=page_missing module=compile page={page}");
                progress.report(&format!("Page gone? {page}"));
                summary.missing_pages += 1;
                continue;
            }
            Err(error) => {
                warn!("event=page_lookup_failed module=compile page={page} error={error:#}");
                progress.report(&format!("Page gone? {page}"));
                summary.missing_pages += 1;
                continue;
            }
        };

        let fresh = api
            .get_changes(page_id, request.depth)?
            .into_iter()
            .filter(|revision| !committed.contains(&revision.id))
            .filter(|revision| known_ids.insert(revision.id))
            .map(|revision| Change::from_revision(page_id, page, revision))
            .collect::<Vec<_>>();
        summary.added_changes += store.extend_changes(&fresh)?;
        changes.extend(fresh);
    }

    sort_changes(&mut changes);
    store.save_changes(&changes)?;
    summary.total_changes = changes.len();
    info!(
        "event=compile_done module=compile pages={} queried={} missing={} added={} total={}",
        summary.page_count,
        summary.queried_pages,
        summary.missing_pages,
        summary.added_changes,
        summary.total_changes
    );
    progress.report(&format!("Total revisions: {}", summary.total_changes));
    Ok((changes, summary))
}

fn resolve_pages(
    api: &mut dyn WikidotApi,
    store: &mut ArchiveStore,
    request: &CompileRequest,
    progress: &dyn ProgressSink,
) -> Result<Vec<String>> {
    if !request.pages.is_empty() {
        return Ok(request.pages.clone());
    }
    let cached = store.load_pages()?;
    if !cached.is_empty() && cached.len() >= request.max_page_count {
        progress.report(&format!("{} pages loaded", cached.len()));
        return Ok(cached);
    }
    let pages = api.list_pages(&request.selector, request.max_page_count)?;
    store.save_pages(&pages)?;
    progress.report(&format!("{} pages listed", pages.len()));
    Ok(pages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SilentProgress;
    use crate::testing::{MockApi, revision};
    use tempfile::tempdir;

    fn request(max_page_count: usize) -> CompileRequest {
        CompileRequest {
            pages: Vec::new(),
            selector: Selector::default(),
            depth: 100,
            max_page_count,
            ignored_pages: vec!["sandbox".to_string()],
        }
    }

    fn two_page_api() -> MockApi {
        let mut api = MockApi::new();
        api.add_page("alpha", 1);
        api.add_page("beta", 2);
        api.add_page("sandbox", 3);
        api.add_revision(1, revision(10, 100, "N", "a", ""), "alpha", "a1");
        api.add_revision(2, revision(20, 50, "N", "b", ""), "beta", "b1");
        api.add_revision(1, revision(11, 200, "S", "a", ""), "alpha", "a2");
        api.add_revision(2, revision(21, 200, "S", "b", ""), "beta", "b2");
        api.add_revision(3, revision(30, 10, "N", "s", ""), "sandbox", "s");
        api
    }

    fn ids(changes: &[Change]) -> Vec<i64> {
        changes.iter().map(|change| change.id).collect()
    }

    #[test]
    fn compile_sorts_by_date_then_id_and_skips_ignored_pages() {
        let temp = tempdir().expect("tempdir");
        let mut store = ArchiveStore::open(temp.path()).expect("store");
        let mut api = two_page_api();
        let (changes, summary) = compile_changes(
            &mut api,
            &mut store,
            &HashSet::new(),
            &request(100),
            &SilentProgress,
        )
        .expect("compile");
        assert_eq!(ids(&changes), vec![20, 10, 11, 21]);
        assert_eq!(summary.added_changes, 4);
        assert_eq!(api.count_calls("get_page_id sandbox"), 0);
        assert_eq!(ids(&store.load_changes().expect("load")), vec![20, 10, 11, 21]);
    }

    #[test]
    fn committed_changes_are_never_re_added() {
        let temp = tempdir().expect("tempdir");
        let mut store = ArchiveStore::open(temp.path()).expect("store");
        let mut api = two_page_api();
        let committed = HashSet::from([10, 20]);
        let (changes, _) = compile_changes(
            &mut api,
            &mut store,
            &committed,
            &request(100),
            &SilentProgress,
        )
        .expect("compile");
        assert_eq!(ids(&changes), vec![11, 21]);
    }

    #[test]
    fn cached_list_is_only_extended_for_unrepresented_pages() {
        let temp = tempdir().expect("tempdir");
        let mut store = ArchiveStore::open(temp.path()).expect("store");
        let mut api = MockApi::new();
        api.add_page("alpha", 1);
        api.add_revision(1, revision(10, 100, "N", "a", ""), "alpha", "a1");
        compile_changes(&mut api, &mut store, &HashSet::new(), &request(1), &SilentProgress)
            .expect("first compile");

        api.add_page("beta", 2);
        api.add_revision(2, revision(20, 50, "N", "b", ""), "beta", "b1");
        api.add_revision(1, revision(12, 300, "S", "a", ""), "alpha", "a3");
        api.calls.clear();
        let (changes, summary) =
            compile_changes(&mut api, &mut store, &HashSet::new(), &request(10), &SilentProgress)
                .expect("second compile");

        assert_eq!(ids(&changes), vec![20, 10]);
        assert_eq!(summary.queried_pages, 1);
        assert_eq!(api.count_calls("get_changes 1"), 0);
        assert_eq!(api.count_calls("list_pages"), 1);
    }

    #[test]
    fn cached_page_list_is_reused_when_it_reaches_the_ceiling() {
        let temp = tempdir().expect("tempdir");
        let mut store = ArchiveStore::open(temp.path()).expect("store");
        store
            .save_pages(&["alpha".to_string(), "beta".to_string()])
            .expect("save pages");
        let mut api = two_page_api();
        compile_changes(&mut api, &mut store, &HashSet::new(), &request(2), &SilentProgress)
            .expect("compile");
        assert_eq!(api.count_calls("list_pages"), 0);
    }

    #[test]
    fn unresolvable_pages_are_skipped() {
        let temp = tempdir().expect("tempdir");
        let mut store = ArchiveStore::open(temp.path()).expect("store");
        let mut api = two_page_api();
        api.page_ids.remove("beta");
        api.failing_page_ids.insert("alpha".to_string());
        let (changes, summary) = compile_changes(
            &mut api,
            &mut store,
            &HashSet::new(),
            &request(100),
            &SilentProgress,
        )
        .expect("compile");
        assert!(changes.is_empty());
        assert_eq!(summary.missing_pages, 2);
    }

    #[test]
    fn explicit_pages_bypass_the_listing() {
        let temp = tempdir().expect("tempdir");
        let mut store = ArchiveStore::open(temp.path()).expect("store");
        let mut api = two_page_api();
        let request = CompileRequest {
            pages: vec!["beta".to_string()],
            ..request(100)
        };
        let (changes, _) =
            compile_changes(&mut api, &mut store, &HashSet::new(), &request, &SilentProgress)
                .expect("compile");
        assert_eq!(ids(&changes), vec![20, 21]);
        assert_eq!(api.count_calls("list_pages"), 0);
    }
}
