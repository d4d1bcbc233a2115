use std::ops::Range;

const CATEGORY_PREFIXES: [&str; 2] = ["Category", "تصنيف"];
const FILE_PREFIXES: [&str; 6] = ["File", "Image", "Media", "ملف", "صورة", "ميديا"];
const UNPARSED_TAGS: [&str; 5] = ["nowiki", "pre", "syntaxhighlight", "source", "math"];
const INVALID_TITLE_CHARS: [char; 7] = ['[', ']', '{', '}', '<', '>', '\n'];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// Plain link to an article or project page.
    Generic,
    Category,
    File,
    /// `[[en:Foo]]` style inter-language link.
    Interlanguage,
    /// Leading-colon link such as `[[:Category:Foo]]` or `[[:en:Foo]]`.
    Colon,
    /// Same-page anchor, `[[#Section]]`.
    Section,
    External,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WikiLink {
    /// Byte range of the whole `[[...]]` construct.
    pub span: Range<usize>,
    /// Byte range of the target portion (between `[[` and the first `|` or `]]`).
    pub target_span: Range<usize>,
    pub target: String,
    pub label: Option<String>,
    pub kind: LinkKind,
}

impl WikiLink {
    pub fn is_generic(&self) -> bool {
        self.kind == LinkKind::Generic
    }

    /// Fragment after `#` in the target, without the hash.
    pub fn fragment(&self) -> Option<&str> {
        self.target.split_once('#').map(|(_, fragment)| fragment.trim())
    }

    pub fn target_without_fragment(&self) -> &str {
        self.target
            .split_once('#')
            .map_or(self.target.as_str(), |(title, _)| title)
    }

    /// Text a reader sees: the label when present and non-empty, else the raw target.
    pub fn display_text(&self) -> &str {
        match self.label.as_deref().map(str::trim) {
            Some(label) if !label.is_empty() => label,
            _ => self.target.trim(),
        }
    }
}

/// Wikilinks of a document, in document order, with exact byte spans.
#[derive(Debug, Clone)]
pub struct WikiTextDocument {
    links: Vec<WikiLink>,
}

impl WikiTextDocument {
    pub fn parse(text: &str) -> Self {
        Self {
            links: scan_links(text),
        }
    }

    pub fn links(&self) -> &[WikiLink] {
        &self.links
    }

}

fn scan_links(text: &str) -> Vec<WikiLink> {
    let bytes = text.as_bytes();
    let lowered = text.to_ascii_lowercase();
    let mut open: Vec<usize> = Vec::new();
    let mut links = Vec::new();
    let mut cursor = 0usize;

    while cursor < bytes.len() {
        if bytes[cursor] == b'<'
            && let Some(resume) = skip_unparsed(&lowered, cursor)
        {
            cursor = resume;
            continue;
        }
        let run = bracket_run(bytes, cursor);
        if run >= 2 && bytes[cursor] == b'[' {
            // `[[[Foo]]]` is a literal `[` followed by `[[Foo]]`.
            open.push(cursor + run - 2);
            cursor += run;
            continue;
        }
        if run >= 2 && bytes[cursor] == b']' {
            let mut offset = 0usize;
            while offset + 2 <= run {
                let Some(start) = open.pop() else {
                    break;
                };
                links.push(build_link(text, start, cursor + offset + 2));
                offset += 2;
            }
            cursor += run;
            continue;
        }
        cursor += run.max(1);
    }

    links.sort_by_key(|link| link.span.start);
    links
}

/// Length of the run of identical square brackets starting at `at`, or 0.
fn bracket_run(bytes: &[u8], at: usize) -> usize {
    let first = bytes[at];
    if first != b'[' && first != b']' {
        return 0;
    }
    bytes[at..].iter().take_while(|byte| **byte == first).count()
}

/// Returns the offset to resume scanning at when `at` opens a comment or a
/// tag whose body is not wikitext.
fn skip_unparsed(lowered: &str, at: usize) -> Option<usize> {
    let rest = &lowered[at..];
    if rest.starts_with("<!--") {
        return Some(
            rest[4..]
                .find("-->")
                .map(|offset| at + 4 + offset + 3)
                .unwrap_or(lowered.len()),
        );
    }

    for tag in UNPARSED_TAGS {
        let Some(after_name) = rest[1..].strip_prefix(tag) else {
            continue;
        };
        if !matches!(after_name.chars().next(), Some('>' | '/' | ' ' | '\t' | '\n')) {
            continue;
        }
        let open_end = rest.find('>')? + 1;
        if rest[..open_end].ends_with("/>") {
            return Some(at + open_end);
        }
        let closing = format!("</{tag}");
        return Some(match rest[open_end..].find(&closing) {
            Some(offset) => {
                let close_start = open_end + offset;
                rest[close_start..]
                    .find('>')
                    .map(|gt| at + close_start + gt + 1)
                    .unwrap_or(lowered.len())
            }
            None => lowered.len(),
        });
    }
    None
}

fn build_link(text: &str, start: usize, end: usize) -> WikiLink {
    let inner_start = start + 2;
    let inner = &text[inner_start..end - 2];
    let (target, label) = match inner.split_once('|') {
        Some((target, label)) => (target, Some(label.to_string())),
        None => (inner, None),
    };

    WikiLink {
        span: start..end,
        target_span: inner_start..inner_start + target.len(),
        target: target.to_string(),
        label,
        kind: classify_target(target),
    }
}

fn classify_target(raw: &str) -> LinkKind {
    let trimmed = raw.trim();
    if trimmed.starts_with(':') {
        return LinkKind::Colon;
    }
    if trimmed.starts_with('#') {
        return LinkKind::Section;
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") || trimmed.starts_with("//")
    {
        return LinkKind::External;
    }

    if let Some((prefix, _)) = trimmed.split_once(':') {
        let prefix = normalize_title(prefix);
        if CATEGORY_PREFIXES
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(&prefix))
        {
            return LinkKind::Category;
        }
        if FILE_PREFIXES
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(&prefix))
        {
            return LinkKind::File;
        }
        if is_language_code(&prefix) {
            return LinkKind::Interlanguage;
        }
    }

    LinkKind::Generic
}

fn is_language_code(prefix: &str) -> bool {
    let mut segments = prefix.split('-');
    let Some(first) = segments.next() else {
        return false;
    };
    (2..=3).contains(&first.len())
        && first.chars().all(|ch| ch.is_ascii_lowercase())
        && segments.all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit())
        })
}

/// Collapse whitespace and underscores to single spaces and drop bidi marks,
/// the same folding MediaWiki applies to titles.
pub fn normalize_title(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    let mut previous_was_space = false;

    for ch in value.chars() {
        if is_bidi_mark(ch) {
            continue;
        }
        if ch == '_' || ch.is_whitespace() {
            if !previous_was_space {
                output.push(' ');
                previous_was_space = true;
            }
        } else {
            output.push(ch);
            previous_was_space = false;
        }
    }

    output.trim().to_string()
}

/// Comparison key: normalized title with a case-folded first letter.
pub fn title_key(value: &str) -> String {
    let normalized = normalize_title(value);
    let mut chars = normalized.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => normalized,
    }
}

pub fn titles_match(left: &str, right: &str) -> bool {
    title_key(left) == title_key(right)
}

/// Whether the cleaned title contains characters MediaWiki forbids in titles.
pub fn has_invalid_title_chars(title: &str) -> bool {
    title.contains(INVALID_TITLE_CHARS)
}

/// Escape a value for use as a positional template argument: top-level `|`
/// becomes `{{!}}` and `=` becomes `&#61;`. Balanced nested templates and
/// links are copied as-is; unbalanced `{{`, `}}`, `[[` and `]]` are written
/// as character references so they cannot open or close the template.
pub fn escape_template_argument(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    let balanced = balanced_pairs(&chars);
    let mut output = String::with_capacity(value.len());
    let mut depth = 0usize;
    let mut index = 0usize;

    while index < chars.len() {
        let ch = chars[index];
        if is_bracket_pair(&chars, index) {
            if !balanced[index] {
                let reference = char_reference(ch);
                output.push_str(reference);
                output.push_str(reference);
            } else {
                if ch == '{' || ch == '[' {
                    depth += 1;
                } else {
                    depth = depth.saturating_sub(1);
                }
                output.push(ch);
                output.push(ch);
            }
            index += 2;
            continue;
        }
        match ch {
            '|' if depth == 0 => output.push_str("{{!}}"),
            '=' if depth == 0 => output.push_str("&#61;"),
            _ => output.push(ch),
        }
        index += 1;
    }

    output
}

/// Marks the first char of every `{{`/`[[` and `}}`/`]]` pair that has a
/// properly nested partner.
fn balanced_pairs(chars: &[char]) -> Vec<bool> {
    let mut balanced = vec![false; chars.len()];
    let mut open: Vec<(char, usize)> = Vec::new();
    let mut index = 0usize;

    while index < chars.len() {
        if !is_bracket_pair(chars, index) {
            index += 1;
            continue;
        }
        let ch = chars[index];
        if ch == '{' || ch == '[' {
            open.push((ch, index));
        } else if open.last().map(|(opener, _)| *opener) == Some(matching_opener(ch))
            && let Some((_, start)) = open.pop()
        {
            balanced[start] = true;
            balanced[index] = true;
        }
        index += 2;
    }

    balanced
}

fn is_bracket_pair(chars: &[char], index: usize) -> bool {
    matches!(chars[index], '{' | '}' | '[' | ']') && chars.get(index + 1) == Some(&chars[index])
}

fn matching_opener(closer: char) -> char {
    if closer == '}' { '{' } else { '[' }
}

fn char_reference(ch: char) -> &'static str {
    match ch {
        '{' => "&#123;",
        '}' => "&#125;",
        '[' => "&#91;",
        _ => "&#93;",
    }
}

fn is_bidi_mark(ch: char) -> bool {
    matches!(ch, '\u{200E}' | '\u{200F}' | '\u{202A}'..='\u{202E}')
}
