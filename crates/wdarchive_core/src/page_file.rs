//! On-disk page representation.
//!
//! New-format files open with a `---` delimited header (`site`, `page`, then
//! optional `title`, `tags`, `parent`) followed by the raw body. Legacy files
//! hold the raw body only.

use anyhow::{Result, bail};

use crate::model::PageFormat;

pub const HEADER_DELIMITER: &str = "---";
const HEADER_KEYS: &[&str] = &["site", "page", "title", "tags", "parent"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageHeader {
    pub site: String,
    pub page: String,
    pub title: Option<String>,
    pub tags: Vec<String>,
    pub parent: Option<String>,
}

impl PageHeader {
    pub fn render(&self) -> String {
        let mut header = format!(
            "{HEADER_DELIMITER}\nsite: {}\npage: {}\n",
            self.site, self.page
        );
        if let Some(title) = self.title.as_deref().filter(|title| !title.is_empty()) {
            header.push_str(&format!("title: {title}\n"));
        }
        if !self.tags.is_empty() {
            header.push_str(&format!("tags: {}\n", self.tags.join(" ")));
        }
        if let Some(parent) = self.parent.as_deref().filter(|parent| !parent.is_empty()) {
            header.push_str(&format!("parent: {parent}\n"));
        }
        header.push_str(HEADER_DELIMITER);
        header.push('\n');
        header
    }
}

pub fn render_page(format: PageFormat, header: &PageHeader, body: &str) -> String {
    if format.uses_header() {
        format!("{}{body}", header.render())
    } else {
        body.to_string()
    }
}

pub fn has_header(content: &str) -> bool {
    content.starts_with(HEADER_DELIMITER)
}

/// Rewrites the `parent:` header line from `old_parent` to `new_parent`.
///
/// A missing line means the file disagrees with recorded state and is fatal.
pub fn replace_parent_field(content: &str, old_parent: &str, new_parent: &str) -> Result<String> {
    let mut output = String::with_capacity(content.len() + new_parent.len());
    let mut replaced = false;
    let mut header_open = false;
    for (index, line) in content.split_inclusive('\n').enumerate() {
        let bare = line.trim_end_matches(['\r', '\n']);
        if index == 0 && bare == HEADER_DELIMITER {
            header_open = true;
            output.push_str(line);
            continue;
        }
        if header_open && bare == HEADER_DELIMITER {
            header_open = false;
        } else if !replaced
            && (header_open || index < HEADER_KEYS.len())
            && let Some(value) = bare.strip_prefix("parent:")
            && value.trim() == old_parent
        {
            let ending = &line[bare.len()..];
            output.push_str(&format!("parent: {new_parent}{ending}"));
            replaced = true;
            continue;
        }
        output.push_str(line);
    }
    if !replaced {
        bail!("expected a parent reference to {old_parent}, but the page has none");
    }
    Ok(output)
}

/// Adds a header to a legacy file; `None` when one is already present.
///
/// Leading bare metadata lines are folded into the header; otherwise the
/// header is built from `fallback`.
pub fn wrap_legacy_header(content: &str, fallback: &PageHeader) -> Option<String> {
    if has_header(content) {
        return None;
    }
    let lines = content.split_inclusive('\n').collect::<Vec<_>>();
    let metadata_lines = lines
        .iter()
        .take_while(|line| {
            HEADER_KEYS
                .iter()
                .any(|key| line.starts_with(&format!("{key}:")))
        })
        .count();

    if metadata_lines == 0 {
        return Some(format!("{}{content}", fallback.render()));
    }

    let mut output = format!("{HEADER_DELIMITER}\n");
    for line in &lines[..metadata_lines] {
        let bare = line.trim_end_matches(['\r', '\n']);
        match bare.split_once(':') {
            Some((key, value)) if !value.starts_with(' ') => {
                output.push_str(&format!("{key}: {value}\n"));
            }
            _ => {
                output.push_str(bare);
                output.push('\n');
            }
        }
    }
    output.push_str(HEADER_DELIMITER);
    output.push('\n');
    for line in &lines[metadata_lines..] {
        output.push_str(line);
    }
    Some(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> PageHeader {
        PageHeader {
            site: "http://example.wikidot.com".to_string(),
            page: "scp-173".to_string(),
            title: Some("SCP-173".to_string()),
            tags: vec!["euclid".to_string(), "scp".to_string()],
            parent: Some("hub".to_string()),
        }
    }

    #[test]
    fn new_format_writes_header_in_fixed_order() {
        let rendered = render_page(PageFormat::New, &header(), "body\n");
        assert_eq!(
            rendered,
            "---\nsite: http://example.wikidot.com\npage: scp-173\ntitle: SCP-173\ntags: euclid scp\nparent: hub\n---\nbody\n"
        );
    }

    #[test]
    fn optional_header_lines_are_omitted() {
        let header = PageHeader {
            title: None,
            tags: Vec::new(),
            parent: None,
            ..header()
        };
        assert_eq!(
            render_page(PageFormat::New, &header, "x"),
            "---\nsite: http://example.wikidot.com\npage: scp-173\n---\nx"
        );
    }

    #[test]
    fn legacy_format_is_the_raw_body() {
        assert_eq!(render_page(PageFormat::Legacy, &header(), "body"), "body");
    }

    #[test]
    fn parent_field_is_rewritten_inside_the_header_only() {
        let content = render_page(PageFormat::New, &header(), "parent: hub\n");
        let updated = replace_parent_field(&content, "hub", "new-hub").expect("replace");
        assert!(updated.contains("parent: new-hub\n---\n"));
        assert!(updated.ends_with("---\nparent: hub\n"));
    }

    #[test]
    fn bare_parent_lines_are_accepted() {
        let updated = replace_parent_field("title: x\nparent:hub\nbody", "hub", "top")
            .expect("replace");
        assert_eq!(updated, "title: x\nparent: top\nbody");
    }

    #[test]
    fn missing_parent_line_is_an_error() {
        let content = render_page(
            PageFormat::New,
            &PageHeader {
                parent: None,
                ..header()
            },
            "body",
        );
        assert!(replace_parent_field(&content, "hub", "top").is_err());
    }

    #[test]
    fn legacy_metadata_lines_are_folded_into_a_header() {
        let wrapped = wrap_legacy_header("title:Old\nparent: hub\nbody\n", &header()).expect("wrap");
        assert_eq!(wrapped, "---\ntitle: Old\nparent: hub\n---\nbody\n");
    }

    #[test]
    fn plain_legacy_bodies_receive_a_synthesised_header() {
        let wrapped = wrap_legacy_header("just body", &header()).expect("wrap");
        assert!(wrapped.starts_with("---\nsite: http://example.wikidot.com\npage: scp-173\n"));
        assert!(wrapped.ends_with("---\njust body"));
        assert!(wrap_legacy_header(&wrapped, &header()).is_none());
    }
}
