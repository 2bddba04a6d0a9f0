//! Markdown helpers shared by the content providers and host indexes.
//!
//! Handles frontmatter splitting/parsing (YAML converted to JSON values so
//! callers get flexible typing), inline tag and embed extraction, and the
//! text cleanup used to build previews.

use serde_json::Value;
use std::collections::HashMap;

/// Parsed frontmatter as a map of string keys to JSON values.
pub type Frontmatter = HashMap<String, Value>;

/// Parsed markdown document
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMarkdown<'a> {
    /// Frontmatter as key-value pairs (None if absent or invalid)
    pub frontmatter: Option<Frontmatter>,
    /// Markdown body (everything after frontmatter)
    pub body: &'a str,
}

/// Split a note into its frontmatter YAML and body, without parsing the YAML.
///
/// Frontmatter must be delimited by `---` lines at the start of the file:
/// ```markdown
/// ---
/// title: My Note
/// tags: [a, b, c]
/// ---
///
/// # Content here
/// ```
pub fn split_frontmatter(raw: &str) -> (Option<&str>, &str) {
    let Some(after_opening) = raw.strip_prefix("---") else {
        return (None, raw);
    };

    let content_start = if let Some(rest) = after_opening.strip_prefix('\n') {
        rest
    } else if let Some(rest) = after_opening.strip_prefix("\r\n") {
        rest
    } else {
        return (None, raw);
    };

    // Closing delimiter must sit on its own line
    let mut pos = 0;
    for line in content_start.split_inclusive('\n') {
        let bare = line.trim_end_matches(['\n', '\r']);
        if bare == "---" {
            let yaml = &content_start[..pos];
            let body = content_start[pos + line.len()..].trim_start_matches(['\n', '\r']);
            return (Some(yaml), body);
        }
        pos += line.len();
    }

    (None, raw)
}

/// Parse a markdown file into frontmatter and body.
///
/// Invalid YAML is treated as "no frontmatter" and the body still excludes it.
pub fn parse(raw: &str) -> ParsedMarkdown<'_> {
    let (yaml, body) = split_frontmatter(raw);
    let frontmatter = yaml.and_then(|yaml| {
        match serde_yaml::from_str::<serde_json::Map<String, Value>>(yaml) {
            Ok(map) if !map.is_empty() => Some(map.into_iter().collect()),
            Ok(_) => None,
            Err(_) => None,
        }
    });
    ParsedMarkdown { frontmatter, body }
}

/// Tags declared in frontmatter under `tags` or `tag`.
///
/// Accepts YAML lists as well as comma/space separated strings. Leading `#`
/// is stripped.
pub fn frontmatter_tags(frontmatter: &Frontmatter) -> Vec<String> {
    let mut tags = Vec::new();
    for (key, value) in frontmatter {
        let key = key.to_lowercase();
        if key != "tags" && key != "tag" {
            continue;
        }
        match value {
            Value::Array(items) => {
                for item in items {
                    if let Some(s) = item.as_str() {
                        push_tag_words(s, &mut tags);
                    } else if item.is_number() {
                        push_tag_words(&item.to_string(), &mut tags);
                    }
                }
            }
            Value::String(s) => push_tag_words(s, &mut tags),
            _ => {}
        }
    }
    tags
}

fn push_tag_words(value: &str, tags: &mut Vec<String>) {
    for word in value.split([',', ' ']) {
        let word = word.trim().trim_start_matches('#').trim_end_matches('/');
        if !word.is_empty() {
            tags.push(word.to_string());
        }
    }
}

fn is_tag_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '/')
}

fn is_fence(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("```") || trimmed.starts_with("~~~")
}

/// Inline `#tags` in the body, without the leading `#`.
///
/// Skips fenced code blocks and inline code. Purely numeric tags (`#123`)
/// are not tags.
pub fn extract_inline_tags(body: &str) -> Vec<String> {
    let mut tags = Vec::new();
    let mut in_fence = false;

    for line in body.lines() {
        if is_fence(line) {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }

        let mut prev: Option<char> = None;
        let mut in_code = false;
        for (i, c) in line.char_indices() {
            if c == '`' {
                in_code = !in_code;
            } else if c == '#' && !in_code && prev.is_none_or(char::is_whitespace) {
                let rest = &line[i + 1..];
                let len: usize = rest
                    .chars()
                    .take_while(|ch| is_tag_char(*ch))
                    .map(char::len_utf8)
                    .sum();
                let tag = rest[..len].trim_end_matches('/');
                if !tag.is_empty() && !tag.chars().all(|ch| ch.is_ascii_digit()) {
                    tags.push(tag.to_string());
                }
            }
            prev = Some(c);
        }
    }

    tags
}

/// For `text](url)tail` returns `(text, url, tail)`.
fn split_link(s: &str) -> Option<(&str, &str, &str)> {
    let close = s.find("](")?;
    let after = &s[close + 2..];
    let end = after.find(')')?;
    Some((&s[..close], &after[..end], &after[end + 1..]))
}

/// Embed targets (`![[target]]` and `![alt](url)`) in document order.
pub fn extract_embeds(body: &str) -> Vec<String> {
    let mut embeds = Vec::new();
    let mut rest = body;

    while let Some(pos) = rest.find('!') {
        let after = &rest[pos + 1..];
        if let Some(inner) = after.strip_prefix("[[") {
            if let Some(end) = inner.find("]]") {
                let target = inner[..end].split('|').next().unwrap_or_default().trim();
                if !target.is_empty() {
                    embeds.push(target.to_string());
                }
                rest = &inner[end + 2..];
                continue;
            }
        } else if let Some(inner) = after.strip_prefix('[') {
            if let Some((_, url, tail)) = split_link(inner) {
                let url = url.split_whitespace().next().unwrap_or_default();
                if !url.is_empty() {
                    embeds.push(url.to_string());
                }
                rest = tail;
                continue;
            }
        }
        rest = after;
    }

    embeds
}

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "svg", "bmp", "avif"];

/// Whether a link target points at an image file.
pub fn is_image_path(target: &str) -> bool {
    let target = target.split(['?', '#']).next().unwrap_or(target);
    target
        .rsplit_once('.')
        .is_some_and(|(_, ext)| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

/// Options for `preview_text`.
#[derive(Debug, Clone, Copy)]
pub struct PreviewOptions {
    pub skip_headings: bool,
    pub skip_code_blocks: bool,
    pub max_chars: usize,
}

/// Maximum preview length in characters.
pub const PREVIEW_MAX_CHARS: usize = 300;

impl Default for PreviewOptions {
    fn default() -> Self {
        Self {
            skip_headings: true,
            skip_code_blocks: true,
            max_chars: PREVIEW_MAX_CHARS,
        }
    }
}

/// Plain-text preview of a markdown body.
pub fn preview_text(body: &str, options: PreviewOptions) -> String {
    let mut pieces = Vec::new();
    let mut in_fence = false;

    for line in body.lines() {
        if is_fence(line) {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            if !options.skip_code_blocks {
                pieces.push(line.trim().to_string());
            }
            continue;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() || is_rule(trimmed) {
            continue;
        }

        let text = if let Some(heading) = heading_text(trimmed) {
            if options.skip_headings {
                continue;
            }
            heading
        } else {
            strip_block_markers(trimmed)
        };

        let cleaned = strip_inline_markdown(text);
        if !cleaned.trim().is_empty() {
            pieces.push(cleaned);
        }
    }

    let joined = pieces.join(" ");
    let collapsed = joined.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(&collapsed, options.max_chars)
}

fn is_rule(line: &str) -> bool {
    line.len() >= 3
        && (line.chars().all(|c| c == '-')
            || line.chars().all(|c| c == '*')
            || line.chars().all(|c| c == '_'))
}

fn heading_text(line: &str) -> Option<&str> {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &line[hashes..];
    if rest.is_empty() {
        Some(rest)
    } else {
        rest.strip_prefix(' ').map(str::trim)
    }
}

fn strip_block_markers(line: &str) -> &str {
    let mut line = line;
    while let Some(rest) = line.strip_prefix('>') {
        line = rest.trim_start();
    }
    for marker in ["- ", "* ", "+ "] {
        if let Some(rest) = line.strip_prefix(marker) {
            line = rest;
            break;
        }
    }
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(rest) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            line = rest;
        }
    }
    for task in ["[ ] ", "[x] ", "[X] "] {
        if let Some(rest) = line.strip_prefix(task) {
            line = rest;
            break;
        }
    }
    line
}

fn strip_inline_markdown(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;

    while let Some(c) = rest.chars().next() {
        if let Some(after) = rest.strip_prefix("![[") {
            if let Some(end) = after.find("]]") {
                rest = &after[end + 2..];
                continue;
            }
        }
        if let Some(after) = rest.strip_prefix("[[") {
            if let Some(end) = after.find("]]") {
                let inner = &after[..end];
                let label = match inner.rsplit_once('|') {
                    Some((_, alias)) => alias,
                    None => inner.split('#').next().unwrap_or(inner),
                };
                out.push_str(label);
                rest = &after[end + 2..];
                continue;
            }
        }
        if let Some(after) = rest.strip_prefix("![") {
            if let Some((_, _, tail)) = split_link(after) {
                rest = tail;
                continue;
            }
        }
        if let Some(after) = rest.strip_prefix('[') {
            if let Some((text, _, tail)) = split_link(after) {
                out.push_str(text);
                rest = tail;
                continue;
            }
        }
        if rest.starts_with("~~") || rest.starts_with("==") {
            rest = &rest[2..];
            continue;
        }
        if c == '*' || c == '`' {
            rest = &rest[1..];
            continue;
        }
        out.push(c);
        rest = &rest[c.len_utf8()..];
    }

    out
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", text[..cut].trim_end()),
        None => text.to_string(),
    }
}

/// Number of words in a markdown body, ignoring pure punctuation tokens.
pub fn word_count(body: &str) -> u64 {
    body.split_whitespace()
        .filter(|word| word.chars().any(char::is_alphanumeric))
        .count() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_frontmatter() {
        let content = "---\ntitle: Test Note\ntags:\n  - rust\n  - cache\n---\n\n# Hello World\n\nThis is the body.";

        let parsed = parse(content);
        let fm = parsed.frontmatter.unwrap();
        assert_eq!(fm.get("title").unwrap(), &Value::String("Test Note".into()));
        assert!(parsed.body.starts_with("# Hello World"));
        assert_eq!(frontmatter_tags(&fm), vec!["rust", "cache"]);
    }

    #[test]
    fn test_parse_without_frontmatter() {
        let content = "# Just a heading\n\nSome content.";
        let parsed = parse(content);
        assert!(parsed.frontmatter.is_none());
        assert_eq!(parsed.body, content);
    }

    #[test]
    fn test_unclosed_frontmatter_is_body() {
        let content = "---\ntitle: nope\n\nbody";
        let (yaml, body) = split_frontmatter(content);
        assert!(yaml.is_none());
        assert_eq!(body, content);
    }

    #[test]
    fn test_frontmatter_tags_from_string() {
        let fm: Frontmatter =
            HashMap::from([("tags".to_string(), Value::String("#one, two/three".into()))]);
        assert_eq!(frontmatter_tags(&fm), vec!["one", "two/three"]);
    }

    #[test]
    fn test_inline_tags_skip_code_and_headings() {
        let body = "# Heading\nText #project/alpha and #todo.\n`#notatag`\n```\n#insidefence\n```\nissue #123";
        assert_eq!(extract_inline_tags(body), vec!["project/alpha", "todo"]);
    }

    #[test]
    fn test_extract_embeds_both_syntaxes() {
        let body = "Intro ![[cover.png|300]] then ![alt](img/photo.jpg \"t\") and [link](x.md)";
        assert_eq!(extract_embeds(body), vec!["cover.png", "img/photo.jpg"]);
        assert!(is_image_path("img/photo.JPG"));
        assert!(!is_image_path("notes/other.md"));
    }

    #[test]
    fn test_preview_strips_markdown() {
        let body = "# Title\n\n- [ ] Buy **milk** from [the shop](https://shop)\n> quoted [[Note#Section]] and [[Other|alias]]\n```\nlet x = 1;\n```\n![img](a.png)";
        let preview = preview_text(body, PreviewOptions::default());
        assert_eq!(preview, "Buy milk from the shop quoted Note and alias");
    }

    #[test]
    fn test_preview_keeps_headings_when_asked() {
        let body = "## Intro\nText";
        let preview = preview_text(
            body,
            PreviewOptions {
                skip_headings: false,
                ..Default::default()
            },
        );
        assert_eq!(preview, "Intro Text");
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let body = "é".repeat(10);
        let preview = preview_text(
            &body,
            PreviewOptions {
                max_chars: 4,
                ..Default::default()
            },
        );
        assert_eq!(preview, "éééé…");
    }

    #[test]
    fn test_word_count_ignores_punctuation() {
        assert_eq!(word_count("Hello, world - it's me ---"), 4);
    }
}
