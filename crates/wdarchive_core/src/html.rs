//! Minimal HTML scanning for the fragments the wiki's AJAX modules return.
//!
//! The responses are machine-generated and regular enough that a tag scanner
//! which understands nesting of a single element name is sufficient. Nothing
//! here attempts to be a general HTML parser.

#[derive(Debug, Clone, Copy)]
pub struct Element<'a> {
    /// The opening tag including angle brackets.
    pub open_tag: &'a str,
    pub inner: &'a str,
    pub start: usize,
    pub end: usize,
}

impl<'a> Element<'a> {
    pub fn attr(&self, name: &str) -> Option<String> {
        attribute(self.open_tag, name)
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.attr("class")
            .is_some_and(|value| value.split_whitespace().any(|item| item == class))
    }

    pub fn text(&self) -> String {
        text_content(self.inner)
    }
}

const VOID_ELEMENTS: &[&str] = &["br", "img", "input", "hr", "meta", "link"];

/// Every element named `tag` in document order, nested ones included.
pub fn elements<'a>(html: &'a str, tag: &str) -> Vec<Element<'a>> {
    let lower = html.to_ascii_lowercase();
    let open_marker = format!("<{}", tag.to_ascii_lowercase());
    let close_marker = format!("</{}", tag.to_ascii_lowercase());
    let is_void = VOID_ELEMENTS.contains(&tag.to_ascii_lowercase().as_str());

    let mut output = Vec::new();
    let mut cursor = 0usize;
    while let Some(offset) = lower[cursor..].find(&open_marker) {
        let start = cursor + offset;
        cursor = start + open_marker.len();
        if !is_tag_boundary(lower.as_bytes(), cursor) {
            continue;
        }
        let Some(open_end) = find_tag_end(html, start) else {
            break;
        };
        let open_tag = &html[start..open_end];
        if is_void || open_tag.ends_with("/>") {
            output.push(Element {
                open_tag,
                inner: "",
                start,
                end: open_end,
            });
            continue;
        }

        let (inner_end, end) = match find_matching_close(&lower, open_end, &open_marker, &close_marker)
        {
            Some(found) => found,
            None => (html.len(), html.len()),
        };
        output.push(Element {
            open_tag,
            inner: &html[open_end..inner_end],
            start,
            end,
        });
    }
    output
}

pub fn first_element<'a>(html: &'a str, tag: &str) -> Option<Element<'a>> {
    elements(html, tag).into_iter().next()
}

pub fn elements_with_class<'a>(html: &'a str, tag: &str, class: &str) -> Vec<Element<'a>> {
    elements(html, tag)
        .into_iter()
        .filter(|element| element.has_class(class))
        .collect()
}

pub fn attribute(open_tag: &str, name: &str) -> Option<String> {
    let lower = open_tag.to_ascii_lowercase();
    let needle = name.to_ascii_lowercase();
    let bytes = lower.as_bytes();
    let mut cursor = 0usize;
    while let Some(offset) = lower[cursor..].find(&needle) {
        let start = cursor + offset;
        cursor = start + needle.len();
        let preceded_by_space = start > 0 && bytes[start - 1].is_ascii_whitespace();
        if !preceded_by_space {
            continue;
        }
        let rest = open_tag[cursor..].trim_start();
        let Some(rest) = rest.strip_prefix('=') else {
            continue;
        };
        let rest = rest.trim_start();
        let value = if let Some(quoted) = rest.strip_prefix('"') {
            quoted.split('"').next().unwrap_or_default()
        } else if let Some(quoted) = rest.strip_prefix('\'') {
            quoted.split('\'').next().unwrap_or_default()
        } else {
            rest.split(|ch: char| ch.is_whitespace() || ch == '>' || ch == '/')
                .next()
                .unwrap_or_default()
        };
        return Some(decode_entities(value));
    }
    None
}

pub fn strip_tags(html: &str) -> String {
    let mut output = String::with_capacity(html.len());
    let mut in_tag = false;
    let mut quote: Option<char> = None;
    for ch in html.chars() {
        if in_tag {
            match (quote, ch) {
                (Some(open), current) if current == open => quote = None,
                (Some(_), _) => {}
                (None, '"') | (None, '\'') => quote = Some(ch),
                (None, '>') => in_tag = false,
                _ => {}
            }
            continue;
        }
        if ch == '<' {
            in_tag = true;
            continue;
        }
        output.push(ch);
    }
    output
}

pub fn text_content(html: &str) -> String {
    decode_entities(&strip_tags(html))
}

pub fn decode_entities(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    let mut output = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(position) = rest.find('&') {
        output.push_str(&rest[..position]);
        rest = &rest[position..];
        let semicolon = rest
            .char_indices()
            .take(12)
            .find(|(_, ch)| *ch == ';')
            .map(|(index, _)| index);
        let Some(semicolon) = semicolon else {
            output.push('&');
            rest = &rest[1..];
            continue;
        };
        let entity = &rest[1..semicolon];
        match decode_entity(entity) {
            Some(decoded) => {
                output.push(decoded);
                rest = &rest[semicolon + 1..];
            }
            None => {
                output.push('&');
                rest = &rest[1..];
            }
        }
    }
    output.push_str(rest);
    output
}

fn decode_entity(entity: &str) -> Option<char> {
    match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => {
            let numeric = entity.strip_prefix('#')?;
            let code = match numeric.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => numeric.parse::<u32>().ok()?,
            };
            char::from_u32(code)
        }
    }
}

/// Removes the first element named `tag` whose `id` attribute equals `id`.
pub fn remove_element_by_id(html: &str, tag: &str, id: &str) -> (String, Option<String>) {
    let found = elements(html, tag)
        .into_iter()
        .find(|element| element.attr("id").as_deref() == Some(id));
    match found {
        Some(element) => {
            let mut output = String::with_capacity(html.len());
            output.push_str(&html[..element.start]);
            output.push_str(&html[element.end..]);
            (output, Some(html[element.start..element.end].to_string()))
        }
        None => (html.to_string(), None),
    }
}

fn is_tag_boundary(bytes: &[u8], index: usize) -> bool {
    match bytes.get(index) {
        Some(byte) => byte.is_ascii_whitespace() || *byte == b'>' || *byte == b'/',
        None => false,
    }
}

fn find_tag_end(html: &str, start: usize) -> Option<usize> {
    let mut quote: Option<u8> = None;
    for (index, byte) in html.as_bytes().iter().enumerate().skip(start) {
        match (quote, *byte) {
            (Some(open), current) if current == open => quote = None,
            (Some(_), _) => {}
            (None, b'"') | (None, b'\'') => quote = Some(*byte),
            (None, b'>') => return Some(index + 1),
            _ => {}
        }
    }
    None
}

fn find_matching_close(
    lower: &str,
    from: usize,
    open_marker: &str,
    close_marker: &str,
) -> Option<(usize, usize)> {
    let bytes = lower.as_bytes();
    let mut depth = 1usize;
    let mut cursor = from;
    loop {
        let next_open = lower[cursor..].find(open_marker).map(|offset| cursor + offset);
        let next_close = lower[cursor..].find(close_marker).map(|offset| cursor + offset)?;
        match next_open {
            Some(open) if open < next_close => {
                cursor = open + open_marker.len();
                if is_tag_boundary(bytes, cursor) {
                    depth += 1;
                }
            }
            _ => {
                depth -= 1;
                let close_end = lower[next_close..]
                    .find('>')
                    .map(|offset| next_close + offset + 1)
                    .unwrap_or(lower.len());
                if depth == 0 {
                    return Some((next_close, close_end));
                }
                cursor = close_end;
            }
        }
    }
}
