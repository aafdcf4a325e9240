use std::fs;
use std::io;
use std::path::Path;
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use log::{debug, warn};
use reqwest::{StatusCode, Url};
use reqwest::blocking::Client;
use reqwest::header::{COOKIE, REFERER, USER_AGENT};
use serde::Deserialize;
use uuid::Uuid;

use crate::config::ClientSettings;
use crate::html::{
    attribute, elements, elements_with_class, first_element, remove_element_by_id, text_content,
};
use crate::model::{ChangeFlag, ImageReference, Ratings, RevisionEntry, Selector, VersionDetail};
use crate::store::IMAGES_DIR;

const AJAX_ENDPOINT: &str = "/ajax-module-connector.php";
const TOKEN_NAME: &str = "wikidot_token7";
const PAGE_ID_MARKER: &str = "WIKIREQUEST.info.pageId = ";
const PAGE_NAME_LABELS: &[&str] = &["Page name:", "페이지 이름:"];

/// Outcome of a single asset download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetOutcome {
    Saved,
    /// Never retried again; the URL is recorded as failed.
    Failed(String),
    /// Not recorded; a later run may try again.
    Skipped(String),
}

/// The narrow read surface the archiver needs from the remote wiki.
pub trait WikidotApi {
    fn list_pages(&mut self, selector: &Selector, limit: usize) -> Result<Vec<String>>;
    fn get_page_id(&mut self, unix_name: &str) -> Result<Option<i64>>;
    fn get_changes(&mut self, page_id: i64, limit: usize) -> Result<Vec<RevisionEntry>>;
    fn get_change_source(&mut self, change_id: i64) -> Result<String>;
    fn get_change_version(&mut self, change_id: i64) -> Result<VersionDetail>;
    fn get_live_tags(&mut self, unix_name: &str) -> Result<Vec<String>>;
    /// Tags at `from_id` as shown by a diff against `to_id`; `None` when the
    /// diff carries no tag row.
    fn get_tag_diff(&mut self, from_id: i64, to_id: i64) -> Result<Option<Vec<String>>>;
    fn get_ratings(&mut self, page_id: i64) -> Result<Ratings>;
    fn download_asset(&mut self, url: &str, destination: &Path) -> Result<AssetOutcome>;
    fn site_url(&self) -> &str;
    fn request_count(&self) -> usize;
}

/// Single global request cadence: every call waits for the slot, then moves
/// it one interval forward.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    next_allowed: Option<Instant>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_allowed: None,
        }
    }

    pub fn acquire(&mut self) {
        if let Some(next) = self.next_allowed {
            let now = Instant::now();
            if next > now {
                sleep(next - now);
            }
        }
        self.next_allowed = Some(Instant::now() + self.interval);
    }
}

enum Attempt<T> {
    Done(T),
    Retry(String),
}

#[derive(Debug, Deserialize)]
struct AjaxEnvelope {
    status: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

pub struct WikidotClient {
    http: Client,
    settings: ClientSettings,
    site: Url,
    limiter: RateLimiter,
    request_count: usize,
}

impl WikidotClient {
    pub fn new(settings: ClientSettings) -> Result<Self> {
        let site = Url::parse(&settings.site_url)
            .with_context(|| format!("invalid site URL: {}", settings.site_url))?;
        let http = Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .context("failed to build wiki HTTP client")?;
        Ok(Self {
            http,
            limiter: RateLimiter::new(Duration::from_millis(settings.delay_ms)),
            settings,
            site,
            request_count: 0,
        })
    }

    fn with_retries<T>(
        &mut self,
        label: &str,
        mut attempt: impl FnMut(&Client) -> Result<Attempt<T>>,
    ) -> Result<T> {
        let Self {
            http,
            settings,
            limiter,
            request_count,
            ..
        } = self;
        retry_attempts(label, settings.max_retries, settings.retry_unit_ms, || {
            limiter.acquire();
            *request_count += 1;
            attempt(&*http)
        })
    }

    /// Posts one module request; returns the envelope body and optional title.
    fn ajax(
        &mut self,
        params: &[(&str, String)],
        url_append: Option<&str>,
    ) -> Result<(String, Option<String>)> {
        let token = new_token();
        let url = format!(
            "{}{AJAX_ENDPOINT}{}",
            self.settings.site_url,
            url_append.unwrap_or_default()
        );
        let mut form = params
            .iter()
            .map(|(key, value)| ((*key).to_string(), value.clone()))
            .collect::<Vec<_>>();
        form.push((TOKEN_NAME.to_string(), token.clone()));
        let module = params
            .iter()
            .find(|(key, _)| *key == "moduleName")
            .map(|(_, value)| value.clone())
            .unwrap_or_else(|| "unknown".to_string());
        let user_agent = self.settings.user_agent.clone();
        debug!("event=ajax_request module=client target={module}");

        self.with_retries(&module, |client| {
            let response = match client
                .post(&url)
                .header(USER_AGENT, &user_agent)
                .header(COOKIE, format!("{TOKEN_NAME}={token}"))
                .form(&form)
                .send()
            {
                Ok(response) => response,
                Err(error) => return Ok(Attempt::Retry(error.to_string())),
            };
            if let Some(reason) = ajax_status(response.status())? {
                return Ok(Attempt::Retry(reason));
            }
            match response.text() {
                Ok(text) => Ok(decode_envelope(&text)),
                Err(error) => Ok(Attempt::Retry(format!("failed to read body: {error}"))),
            }
        })
    }

    /// Fetches the rendered page document; `None` when the page is gone.
    fn page_document(&mut self, unix_name: &str) -> Result<Option<String>> {
        let url = format!("{}/{}/noredirect/true", self.settings.site_url, unix_name);
        let user_agent = self.settings.user_agent.clone();
        let label = format!("page {unix_name}");
        self.with_retries(&label, |client| {
            let response = match client.get(&url).header(USER_AGENT, &user_agent).send() {
                Ok(response) => response,
                Err(error) => return Ok(Attempt::Retry(error.to_string())),
            };
            let status = response.status();
            if status.is_server_error() {
                return Ok(Attempt::Retry(format!("HTTP {status}")));
            }
            if status.as_u16() == 404 {
                return Ok(Attempt::Done(None));
            }
            if !status.is_success() {
                bail!("HTTP {status} while fetching {url}");
            }
            let text = response
                .text()
                .with_context(|| format!("failed to read {url}"))?;
            Ok(Attempt::Done(Some(text)))
        })
    }
}

impl WikidotApi for WikidotClient {
    fn list_pages(&mut self, selector: &Selector, limit: usize) -> Result<Vec<String>> {
        let mut pages = Vec::new();
        let mut offset = 1u32;
        loop {
            let mut params = vec![
                ("moduleName", "list/ListPagesModule".to_string()),
                (
                    "perPage",
                    if limit > 0 { limit.to_string() } else { "10000".to_string() },
                ),
                ("module_body", "%%page_unix_name%%".to_string()),
                ("separate", "false".to_string()),
                ("p", offset.to_string()),
                ("category", selector.category.clone()),
                ("order", "dateCreatedDesc".to_string()),
            ];
            if limit > 0 {
                params.push(("limit", limit.to_string()));
            }
            if let Some(tags) = &selector.tags {
                params.push(("tags", tags.clone()));
            }
            if let Some(created_by) = &selector.created_by {
                params.push(("created_by", created_by.clone()));
            }

            let (body, _) = self.ajax(&params, Some(&format!("/p/{offset}")))?;
            let listing = parse_page_listing(&body);
            pages.extend(listing.names);
            debug!(
                "event=list_pages module=client page={offset} total={}",
                pages.len()
            );
            if limit > 0 && pages.len() >= limit {
                pages.truncate(limit);
                break;
            }
            match listing.next_page {
                Some(next) if next == offset + 1 => offset = next,
                _ => break,
            }
        }
        Ok(pages)
    }

    fn get_page_id(&mut self, unix_name: &str) -> Result<Option<i64>> {
        let document = self.page_document(unix_name)?;
        Ok(document.as_deref().and_then(parse_page_id))
    }

    fn get_changes(&mut self, page_id: i64, limit: usize) -> Result<Vec<RevisionEntry>> {
        let per_page = if limit > 0 { limit.to_string() } else { "10000".to_string() };
        let (body, _) = self.ajax(
            &[
                ("moduleName", "history/PageRevisionListModule".to_string()),
                ("page_id", page_id.to_string()),
                ("page", "1".to_string()),
                ("perpage", per_page),
                ("options", r#"{"all":true}"#.to_string()),
            ],
            None,
        )?;
        Ok(parse_revision_rows(&body))
    }

    fn get_change_source(&mut self, change_id: i64) -> Result<String> {
        let (body, _) = self.ajax(
            &[
                ("moduleName", "history/PageSourceModule".to_string()),
                ("revision_id", change_id.to_string()),
            ],
            None,
        )?;
        Ok(parse_source(&body))
    }

    fn get_change_version(&mut self, change_id: i64) -> Result<VersionDetail> {
        let (body, title) = self.ajax(
            &[
                ("moduleName", "history/PageVersionModule".to_string()),
                ("revision_id", change_id.to_string()),
            ],
            None,
        )?;
        Ok(parse_version(&self.site, change_id, &body, title))
    }

    fn get_live_tags(&mut self, unix_name: &str) -> Result<Vec<String>> {
        let document = self.page_document(unix_name)?;
        Ok(document.as_deref().map(parse_page_tags).unwrap_or_default())
    }

    fn get_tag_diff(&mut self, from_id: i64, to_id: i64) -> Result<Option<Vec<String>>> {
        let (body, _) = self.ajax(
            &[
                ("moduleName", "history/PageDiffModule".to_string()),
                ("from_revision_id", from_id.to_string()),
                ("to_revision_id", to_id.to_string()),
                ("show_type", "inline".to_string()),
            ],
            None,
        )?;
        Ok(parse_tag_diff(&body))
    }

    fn get_ratings(&mut self, page_id: i64) -> Result<Ratings> {
        let (body, _) = self.ajax(
            &[
                ("moduleName", "pagerate/WhoRatedPageModule".to_string()),
                ("pageId", page_id.to_string()),
            ],
            None,
        )?;
        Ok(parse_ratings(&body))
    }

    fn download_asset(&mut self, url: &str, destination: &Path) -> Result<AssetOutcome> {
        if let Some(parent) = destination.parent()
            && let Err(error) = fs::create_dir_all(parent)
        {
            if is_name_too_long(&error) {
                return Ok(AssetOutcome::Skipped(format!("path too long: {error}")));
            }
            return Err(error)
                .with_context(|| format!("failed to create {}", parent.display()));
        }

        let user_agent = self.settings.user_agent.clone();
        let label = format!("asset {url}");
        let fetched = self.with_retries(&label, |client| {
            let response = match client
                .get(url)
                .header(USER_AGENT, &user_agent)
                .header(REFERER, "wdarchive")
                .send()
            {
                Ok(response) => response,
                Err(error) => return Ok(Attempt::Retry(error.to_string())),
            };
            let status = response.status();
            if status.is_server_error() {
                return Ok(Attempt::Retry(format!("HTTP {status}")));
            }
            if !status.is_success() {
                return Ok(Attempt::Done(Err(format!("HTTP {status}"))));
            }
            match response.bytes() {
                Ok(bytes) => Ok(Attempt::Done(Ok(bytes.to_vec()))),
                Err(error) => Ok(Attempt::Retry(error.to_string())),
            }
        });

        let bytes = match fetched {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(reason)) => return Ok(AssetOutcome::Failed(reason)),
            Err(error) => return Ok(AssetOutcome::Failed(format!("{error:#}"))),
        };
        if !looks_like_image(&bytes) {
            return Ok(AssetOutcome::Failed("downloaded payload is not an image".to_string()));
        }
        match fs::write(destination, &bytes) {
            Ok(()) => Ok(AssetOutcome::Saved),
            Err(error) if is_name_too_long(&error) => {
                Ok(AssetOutcome::Skipped(format!("file name too long: {error}")))
            }
            Err(error) => {
                Err(error).with_context(|| format!("failed to write {}", destination.display()))
            }
        }
    }

    fn site_url(&self) -> &str {
        &self.settings.site_url
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

/// Lowercased host of a site URL, used for author e-mail addresses.
pub fn site_host(site_url: &str) -> String {
    Url::parse(site_url)
        .ok()
        .and_then(|url| url.host_str().map(str::to_ascii_lowercase))
        .unwrap_or_else(|| "wikidot".to_string())
}

/// `unit * attempt^3`, so five attempts wait at most 224 units in total.
/// Runs `attempt` until it is done, sleeping with cubic backoff between
/// retries. An `Err` from `attempt` is permanent and ends the loop at once.
fn retry_attempts<T>(
    label: &str,
    max_attempts: usize,
    retry_unit_ms: u64,
    mut attempt: impl FnMut() -> Result<Attempt<T>>,
) -> Result<T> {
    let max_attempts = max_attempts.max(1);
    let mut last_reason = String::from("no attempt made");
    for attempt_number in 1..=max_attempts {
        match attempt()? {
            Attempt::Done(value) => return Ok(value),
            Attempt::Retry(reason) => {
                warn!(
                    "event=request_retry module=client target={label} attempt={attempt_number} max={max_attempts} reason={reason}"
                );
                last_reason = reason;
                if attempt_number < max_attempts {
                    sleep(backoff_delay(retry_unit_ms, attempt_number));
                }
            }
        }
    }
    bail!("{label} failed after {max_attempts} attempts: {last_reason}")
}

/// `None` on success, the retry reason for server-side failures. Client
/// errors are permanent and returned as `Err`.
fn ajax_status(status: StatusCode) -> Result<Option<String>> {
    if status.is_success() {
        return Ok(None);
    }
    if status.is_client_error() {
        bail!("HTTP {status} from {AJAX_ENDPOINT}");
    }
    Ok(Some(format!("HTTP {status}")))
}

/// Body and non-empty title of an `ok` envelope. Undecodable bodies and any
/// other status are retried.
fn decode_envelope(text: &str) -> Attempt<(String, Option<String>)> {
    let envelope: AjaxEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(error) => return Attempt::Retry(format!("malformed JSON body: {error}")),
    };
    if envelope.status != "ok" {
        return Attempt::Retry(format!(
            "status {}: {}",
            envelope.status,
            envelope.message.unwrap_or_default()
        ));
    }
    Attempt::Done((
        envelope.body.unwrap_or_default(),
        envelope.title.filter(|title| !title.is_empty()),
    ))
}

pub fn backoff_delay(unit_ms: u64, attempt: usize) -> Duration {
    let attempt = u64::try_from(attempt).unwrap_or(u64::MAX);
    Duration::from_millis(unit_ms.saturating_mul(attempt.saturating_pow(3)))
}

fn new_token() -> String {
    Uuid::new_v4().simple().to_string()[..10].to_string()
}

fn is_name_too_long(error: &io::Error) -> bool {
    // ENAMETOOLONG on Linux.
    error.raw_os_error() == Some(36)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageListing {
    pub names: Vec<String>,
    pub next_page: Option<u32>,
}

pub fn parse_page_listing(body: &str) -> PageListing {
    let normalized = body.replace("<br/>", "\n").replace("<br />", "\n");
    let names = first_element(&normalized, "div")
        .and_then(|div| first_element(div.inner, "p"))
        .map(|paragraph| {
            paragraph
                .text()
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let targets = elements_with_class(&normalized, "span", "target");
    let has_current = !elements_with_class(&normalized, "span", "current").is_empty();
    let next_page = if targets.len() < 2 || !has_current {
        None
    } else {
        targets
            .last()
            .and_then(|target| first_element(target.inner, "a"))
            .and_then(|link| link.attr("href"))
            .and_then(|href| {
                href.trim_end_matches('/')
                    .rsplit('/')
                    .next()
                    .and_then(|segment| segment.parse::<u32>().ok())
            })
    };
    PageListing { names, next_page }
}

pub fn parse_page_id(document: &str) -> Option<i64> {
    let position = document.find(PAGE_ID_MARKER)? + PAGE_ID_MARKER.len();
    let rest = &document[position..];
    let end = rest.find(';').unwrap_or(rest.len());
    rest[..end].trim().parse::<i64>().ok()
}

pub fn parse_page_tags(document: &str) -> Vec<String> {
    elements_with_class(document, "div", "page-tags")
        .first()
        .map(|container| {
            elements(container.inner, "a")
                .iter()
                .map(|link| link.text().trim().to_string())
                .filter(|tag| !tag.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

pub fn parse_revision_rows(body: &str) -> Vec<RevisionEntry> {
    let mut revisions = Vec::new();
    for row in elements(body, "tr") {
        let Some(id) = first_element(row.inner, "input")
            .and_then(|input| input.attr("value"))
            .and_then(|value| value.trim().parse::<i64>().ok())
        else {
            continue;
        };

        let spans = elements(row.inner, "span");
        let attached_file = spans
            .iter()
            .any(|span| span.attr("title").as_deref() == Some("file/attachment action"));
        let flag = spans
            .iter()
            .find(|span| span.has_class("spantip"))
            .map(|span| span.text().trim().to_string())
            .filter(|text| !text.is_empty())
            .map(|text| ChangeFlag::parse(&text));
        let date = spans
            .iter()
            .find(|span| span.has_class("odate"))
            .and_then(|span| span.attr("class"))
            .and_then(|classes| {
                classes
                    .split_whitespace()
                    .find_map(|class| class.strip_prefix("time_")?.parse::<i64>().ok())
            })
            .unwrap_or(0);
        let user = spans
            .iter()
            .find(|span| span.has_class("printuser"))
            .and_then(|span| elements(span.inner, "a").last().map(|link| link.text()))
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty());
        let comment = elements(row.inner, "td")
            .last()
            .map(|cell| cell.text().trim().to_string())
            .unwrap_or_default();

        revisions.push(RevisionEntry {
            id,
            flag,
            date,
            user,
            comment,
            attached_file,
        });
    }
    revisions
}

pub fn parse_tag_diff(body: &str) -> Option<Vec<String>> {
    // Cells in the diff module carry stray closing anchors.
    let cleaned = body.replace("</a>", "");
    for row in elements(&cleaned, "tr") {
        let cells = elements(row.inner, "td");
        if cells.len() < 3 || cells[0].text().trim() != "Tags:" {
            continue;
        }
        let tags = cells[1]
            .text()
            .split_whitespace()
            .map(ToString::to_string)
            .collect();
        return Some(tags);
    }
    None
}

pub fn parse_source(body: &str) -> String {
    let text = match first_element(body, "div") {
        Some(div) => div.text(),
        None => text_content(body),
    };
    text.trim_start_matches([' ', '\r', '\n']).to_string()
}

pub fn parse_version(site: &Url, change_id: i64, body: &str, title: Option<String>) -> VersionDetail {
    let (content, info_block) = remove_element_by_id(body, "div", "page-version-info");
    let unix_name = info_block.as_deref().and_then(|block| {
        elements(block, "tr").iter().find_map(|row| {
            let cells = elements(row.inner, "td");
            if cells.len() < 2 {
                return None;
            }
            let label = cells[0].text();
            if PAGE_NAME_LABELS.contains(&label.trim()) {
                Some(cells[1].text().trim().to_string()).filter(|name| !name.is_empty())
            } else {
                None
            }
        })
    });

    let mut images: Vec<ImageReference> = Vec::new();
    for block in elements_with_class(&content, "div", "scp-image-block") {
        let mut source = None;
        if let Some(link) = first_element(block.inner, "a")
            && let Some(image) = elements_with_class(link.inner, "img", "enlarge").first()
        {
            source = link
                .attr("href")
                .map(|href| (href, image.attr("alt").unwrap_or_default()));
        }
        if source.is_none()
            && let Some(image) = first_element(block.inner, "img")
        {
            source = image
                .attr("src")
                .map(|src| (src, image.attr("alt").unwrap_or_default()));
        }
        let Some((src, name)) = source else {
            continue;
        };
        if let Some(reference) = image_reference(site, &src, &name)
            && !images
                .iter()
                .any(|existing| existing.target_path == reference.target_path)
        {
            images.push(reference);
        }
    }

    VersionDetail {
        change_id,
        unix_name,
        title,
        rendered_content: content,
        images,
    }
}

/// Maps an image URL to `images/<host>/<directory>/<name>` under the archive.
pub fn image_reference(site: &Url, src: &str, display_name: &str) -> Option<ImageReference> {
    let src = src
        .trim()
        .replace("http://http://", "http://")
        .replace("https://https://", "https://");
    if src.is_empty() {
        return None;
    }
    let is_absolute = Url::parse(&src).is_ok();
    let absolute = site.join(&src).ok()?;
    let directory = absolute.join(".").ok()?;

    let mut path = String::new();
    if is_absolute && let Some(host) = directory.host_str() {
        path.push_str(host);
        if let Some(port) = directory.port() {
            path.push_str(&format!(":{port}"));
        }
        path.push('/');
    }
    path.push_str(directory.path().trim_start_matches('/'));

    let name = display_name.trim().replace(['/', '\\'], "_");
    let file_name = if name.is_empty() || name == "." || name == ".." {
        absolute
            .path_segments()
            .and_then(|mut segments| segments.next_back().map(ToString::to_string))
            .filter(|segment| !segment.is_empty())?
    } else {
        name.clone()
    };
    if path.is_empty() || path.ends_with('/') {
        path.push_str(&file_name);
    }

    let mut path = path.replace("http://", "").replace("https://", "");
    while path.contains("//") {
        path = path.replace("//", "/");
    }
    let path = path.replace(':', "~");

    Some(ImageReference {
        source_url: absolute.to_string(),
        display_name: name,
        target_path: format!("{IMAGES_DIR}/{}", path.trim_start_matches('/')),
    })
}

pub fn parse_ratings(body: &str) -> Ratings {
    let mut ratings = Ratings::default();
    let normalized = body.replace("<br />", "<br/>");
    for chunk in normalized.split("<br/>") {
        let spans = elements(chunk, "span");
        let Some(vote) = spans
            .iter()
            .rev()
            .find(|span| !span.inner.contains('<'))
            .map(|span| span.text().trim().to_string())
            .filter(|vote| !vote.is_empty())
        else {
            continue;
        };
        if let Some(deleted) = spans.iter().find(|span| span.has_class("deleted")) {
            if let Some(user_id) = deleted.attr("data-id") {
                ratings.deleted.insert(user_id, vote);
            }
            continue;
        }
        let user_id = elements(chunk, "a").iter().find_map(|link| {
            let onclick = attribute(link.open_tag, "onclick")?;
            let start = onclick.find("userInfo(")? + "userInfo(".len();
            let end = onclick[start..].find(')')? + start;
            Some(onclick[start..end].trim().to_string())
        });
        if let Some(user_id) = user_id {
            ratings.normal.insert(user_id, vote);
        }
    }
    ratings
}

pub fn looks_like_image(bytes: &[u8]) -> bool {
    const SIGNATURES: &[&[u8]] = &[
        b"\x89PNG\r\n\x1a\n",
        b"\xff\xd8\xff",
        b"GIF87a",
        b"GIF89a",
        b"BM",
        b"II*\x00",
        b"MM\x00*",
        b"\x00\x00\x01\x00",
    ];
    if SIGNATURES.iter().any(|signature| bytes.starts_with(signature)) {
        return true;
    }
    if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return true;
    }
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(512)]).to_ascii_lowercase();
    let head = head.trim_start();
    (head.starts_with("<svg") || head.starts_with("<?xml")) && head.contains("<svg")
}
