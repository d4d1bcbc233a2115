use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, bail};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_FALLBACK_TEMPLATE, LocalizerConfig};
use crate::gateway::RemoteWikiGateway;
use crate::resolver::{LangLinkResolver, ResolutionOutcome};
use crate::wikitext::{WikiLink, WikiTextDocument, escape_template_argument, titles_match};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEdit {
    pub span: Range<usize>,
    pub replacement: String,
}

/// Source text plus a set of disjoint span replacements.
#[derive(Debug, Clone)]
pub struct AnnotatedDocument<'a> {
    text: &'a str,
    edits: Vec<TextEdit>,
}

impl<'a> AnnotatedDocument<'a> {
    pub fn new(text: &'a str) -> Self {
        Self {
            text,
            edits: Vec::new(),
        }
    }

    pub fn edits(&self) -> &[TextEdit] {
        &self.edits
    }

    /// Queue a replacement. Rejects spans outside the text, spans not on char
    /// boundaries and spans overlapping an earlier edit.
    pub fn replace(&mut self, span: Range<usize>, replacement: impl Into<String>) -> Result<()> {
        if span.start > span.end || span.end > self.text.len() {
            bail!(
                "edit span {}..{} is outside a document of {} bytes",
                span.start,
                span.end,
                self.text.len()
            );
        }
        if !self.text.is_char_boundary(span.start) || !self.text.is_char_boundary(span.end) {
            bail!("edit span {}..{} splits a character", span.start, span.end);
        }
        if let Some(existing) = self
            .edits
            .iter()
            .find(|edit| edit.span.start < span.end && span.start < edit.span.end)
        {
            bail!(
                "edit span {}..{} overlaps {}..{}",
                span.start,
                span.end,
                existing.span.start,
                existing.span.end
            );
        }
        self.edits.push(TextEdit {
            span,
            replacement: replacement.into(),
        });
        Ok(())
    }

    /// Render the text with every queued edit applied.
    pub fn apply(&self) -> String {
        let mut ordered: Vec<&TextEdit> = self.edits.iter().collect();
        ordered.sort_by_key(|edit| edit.span.start);

        let mut output = String::with_capacity(self.text.len());
        let mut cursor = 0usize;
        for edit in ordered {
            output.push_str(&self.text[cursor..edit.span.start]);
            output.push_str(&edit.replacement);
            cursor = edit.span.end;
        }
        output.push_str(&self.text[cursor..]);
        output
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LocalizeReport {
    pub text: String,
    pub links_seen: usize,
    pub links_skipped: usize,
    pub links_replaced: usize,
    pub fallbacks: usize,
    pub errors: Vec<String>,
    pub cancelled: bool,
}

impl LocalizeReport {
    pub fn changed(&self) -> bool {
        self.links_replaced > 0 || self.fallbacks > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalizerSettings {
    pub local_lang: String,
    pub fallback_template: String,
    pub max_redirect_hops: usize,
}

impl LocalizerSettings {
    pub fn from_config(config: &LocalizerConfig) -> Self {
        Self {
            local_lang: config.local_lang(),
            fallback_template: config.fallback_template().to_string(),
            max_redirect_hops: config.max_redirect_hops(),
        }
    }
}

impl Default for LocalizerSettings {
    fn default() -> Self {
        Self::from_config(&LocalizerConfig::default())
    }
}

/// Rewrites the generic wikilinks of a document to their local equivalents.
pub struct WikiLocalizer<L, F> {
    resolver: LangLinkResolver<L, F>,
    fallback_template: String,
    cancel: Option<Arc<AtomicBool>>,
}

impl<L: RemoteWikiGateway, F: RemoteWikiGateway> WikiLocalizer<L, F> {
    pub fn new(local: L, foreign: F, settings: &LocalizerSettings) -> Self {
        let resolver = LangLinkResolver::new(local, foreign, settings.local_lang.clone())
            .with_max_redirect_hops(settings.max_redirect_hops);
        Self::with_resolver(resolver, &settings.fallback_template)
    }

    pub fn with_resolver(resolver: LangLinkResolver<L, F>, fallback_template: &str) -> Self {
        let fallback_template = match fallback_template.trim() {
            "" => DEFAULT_FALLBACK_TEMPLATE.to_string(),
            name => name.to_string(),
        };
        Self {
            resolver,
            fallback_template,
            cancel: None,
        }
    }

    /// Stop before the next link once `flag` is raised.
    pub fn with_cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn localize_content(&mut self, text: &str) -> LocalizeReport {
        let parsed = WikiTextDocument::parse(text);
        let mut document = AnnotatedDocument::new(text);
        let mut report = LocalizeReport {
            text: String::new(),
            links_seen: parsed.links().len(),
            links_skipped: 0,
            links_replaced: 0,
            fallbacks: 0,
            errors: Vec::new(),
            cancelled: false,
        };

        for link in parsed.links() {
            if !link.is_generic() {
                report.links_skipped += 1;
                continue;
            }
            if self.is_cancelled() {
                info!("localization cancelled before {}", link.target.trim());
                report.cancelled = true;
                break;
            }

            let resolution = self.resolver.resolve(&link.target);
            report
                .errors
                .extend(resolution.errors.iter().map(ToString::to_string));

            let edit = match resolution.outcome {
                ResolutionOutcome::LocalFound { resolved_title } => {
                    if titles_match(&resolved_title, link.target_without_fragment()) {
                        continue;
                    }
                    Some((
                        link.target_span.clone(),
                        retarget(link, &resolved_title),
                        EditKind::Retarget,
                    ))
                }
                ResolutionOutcome::ForeignOnly { foreign_title } => Some((
                    link.span.clone(),
                    self.fallback_annotation(link, &foreign_title),
                    EditKind::Fallback,
                )),
                ResolutionOutcome::NotFound => None,
            };

            let Some((span, replacement, kind)) = edit else {
                continue;
            };
            debug!(
                target_title = link.target.trim(),
                %replacement,
                "queueing link rewrite"
            );
            match document.replace(span, replacement) {
                Ok(()) => match kind {
                    EditKind::Retarget => report.links_replaced += 1,
                    EditKind::Fallback => report.fallbacks += 1,
                },
                Err(error) => {
                    warn!(%error, "dropping link rewrite");
                    report.errors.push(format!("{}: {error:#}", link.target.trim()));
                }
            }
        }

        report.text = document.apply();
        info!(
            links = report.links_seen,
            replaced = report.links_replaced,
            fallbacks = report.fallbacks,
            errors = report.errors.len(),
            "localized document"
        );
        report
    }

    fn fallback_annotation(&self, link: &WikiLink, foreign_title: &str) -> String {
        format!(
            "{{{{{}|{}|{}}}}}",
            self.fallback_template,
            escape_template_argument(link.display_text()),
            escape_template_argument(foreign_title)
        )
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy)]
enum EditKind {
    Retarget,
    Fallback,
}

/// New target text for a link, keeping its `#fragment`.
fn retarget(link: &WikiLink, resolved_title: &str) -> String {
    match link.fragment() {
        Some(fragment) if !fragment.is_empty() => format!("{resolved_title}#{fragment}"),
        _ => resolved_title.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::gateway::testing::StubWiki;

    fn localize(local: StubWiki, foreign: StubWiki, text: &str) -> LocalizeReport {
        let mut localizer = WikiLocalizer::new(local, foreign, &LocalizerSettings::default());
        localizer.localize_content(text)
    }

    #[test]
    fn text_without_links_is_unchanged() {
        let text = "نص بلا وصلات {{قالب|س}}";
        let report = localize(StubWiki::default(), StubWiki::default(), text);
        assert_eq!(report.text, text);
        assert_eq!(report.links_replaced, 0);
        assert_eq!(report.fallbacks, 0);
        assert!(!report.changed());
    }

    #[test]
    fn mixed_local_and_foreign_only_links() {
        let local = StubWiki::with_pages(&["Foo"]);
        let foreign = StubWiki::with_pages(&["Bar"]);
        let report = localize(local, foreign, "see [[Foo]] and [[Bar|baz]]");

        assert_eq!(report.text, "see [[Foo]] and {{وإو|baz|Bar}}");
        assert_eq!(report.links_replaced, 0);
        assert_eq!(report.fallbacks, 1);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn redirect_chain_rewrites_target_only() {
        let local = StubWiki::with_pages(&["C"])
            .redirect("A", "B")
            .redirect("B", "C");
        let report = localize(local, StubWiki::default(), "x [[A]] y [[A|label]] z");

        assert_eq!(report.text, "x [[C]] y [[C|label]] z");
        assert_eq!(report.links_replaced, 2);
    }

    #[test]
    fn identical_resolution_is_not_counted() {
        let local = StubWiki::with_pages(&["Foo bar", "foo bar"]);
        let text = "[[Foo bar]] [[Foo_bar|x]] [[foo bar#History]]";
        let report = localize(local, StubWiki::default(), text);
        assert_eq!(report.text, text);
        assert_eq!(report.links_replaced, 0);
    }

    #[test]
    fn localizing_twice_is_a_no_op() {
        let local = || StubWiki::with_pages(&["مصر"]).redirect("Egypt ar", "مصر");
        let first = localize(local(), StubWiki::default(), "[[Egypt_ar]]");
        assert_eq!(first.text, "[[مصر]]");
        let second = localize(local(), StubWiki::default(), &first.text);
        assert_eq!(second.text, first.text);
        assert!(!second.changed());
    }

    #[test]
    fn foreign_langlink_retargets_and_keeps_fragment() {
        let foreign = StubWiki::with_pages(&["Egypt"]).langlink("Egypt", "ar", "مصر");
        let report = localize(
            StubWiki::default(),
            foreign,
            "[[Egypt#History|تاريخ مصر]]",
        );
        assert_eq!(report.text, "[[مصر#History|تاريخ مصر]]");
        assert_eq!(report.links_replaced, 1);
    }

    #[test]
    fn circular_redirect_leaves_link_unchanged_and_finishes() {
        let local = StubWiki::default().redirect("A", "B").redirect("B", "A");
        let started = Instant::now();
        let report = localize(local, StubWiki::with_pages(&["A"]), "[[A]]");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(report.text, "[[A]]");
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("circular redirect"));
    }

    #[test]
    fn not_found_and_special_links_are_untouched() {
        let text = "[[Nowhere]] [[تصنيف:أشخاص]] [[ملف:x.jpg|تصغير|[[Bar]]]] [[:en:Bar]]";
        let foreign = StubWiki::with_pages(&["Bar"]);
        let report = localize(StubWiki::default(), foreign, text);

        assert_eq!(
            report.text,
            "[[Nowhere]] [[تصنيف:أشخاص]] [[ملف:x.jpg|تصغير|{{وإو|Bar|Bar}}]] [[:en:Bar]]"
        );
        assert_eq!(report.links_seen, 5);
        assert_eq!(report.links_skipped, 3);
        assert_eq!(report.fallbacks, 1);
    }

    #[test]
    fn one_bad_link_does_not_block_the_rest() {
        let local = StubWiki::with_pages(&["C"]).redirect("A", "C");
        let foreign = StubWiki::with_pages(&["Broken"]).failing("Broken");
        let report = localize(local, foreign, "[[|empty]] [[Broken]] [[A]]");

        assert_eq!(report.text, "[[|empty]] [[Broken]] [[C]]");
        assert_eq!(report.links_replaced, 1);
        assert_eq!(report.errors.len(), 2);
        assert!(report.errors[0].contains("malformed link target"));
        assert!(report.errors[1].contains("foreign wiki request failed"));
    }

    #[test]
    fn fallback_escapes_separators_in_display_text() {
        let foreign = StubWiki::with_pages(&["Bar"]);
        let report = localize(StubWiki::default(), foreign, "[[Bar|a=b|c]]");
        assert_eq!(report.text, "{{وإو|a&#61;b{{!}}c|Bar}}");
    }

    #[test]
    fn fallback_cannot_be_closed_early_by_stray_braces() {
        let foreign = StubWiki::with_pages(&["Bar"]);
        let report = localize(StubWiki::default(), foreign, "[[Bar|a}}b]] [[Bar|c]]d]]");
        assert_eq!(
            report.text,
            "{{وإو|a&#125;&#125;b|Bar}} {{وإو|c|Bar}}d]]"
        );
        assert_eq!(report.fallbacks, 2);
    }

    #[test]
    fn link_wrapped_in_extra_brackets_is_localized() {
        let foreign = StubWiki::with_pages(&["Foo"]);
        let report = localize(StubWiki::default(), foreign, "x [[[Foo]]] y");
        assert_eq!(report.text, "x [{{وإو|Foo|Foo}}] y");
        assert!(report.errors.is_empty());

        let local = StubWiki::with_pages(&["C"]).redirect("A", "C");
        let report = localize(local, StubWiki::default(), "[[[A]]]");
        assert_eq!(report.text, "[[[C]]]");
        assert_eq!(report.links_replaced, 1);
    }

    #[test]
    fn configured_template_name_is_used() {
        let settings = LocalizerSettings {
            fallback_template: "Ill".to_string(),
            ..LocalizerSettings::default()
        };
        let mut localizer = WikiLocalizer::new(
            StubWiki::default(),
            StubWiki::with_pages(&["Bar"]),
            &settings,
        );
        assert_eq!(localizer.localize_content("[[Bar]]").text, "{{Ill|Bar|Bar}}");
    }

    #[test]
    fn cancellation_stops_before_next_link() {
        let flag = Arc::new(AtomicBool::new(true));
        let local = StubWiki::with_pages(&["C"]).redirect("A", "C");
        let mut localizer = WikiLocalizer::new(local, StubWiki::default(), &LocalizerSettings::default())
            .with_cancellation(flag.clone());

        let report = localizer.localize_content("[[A]] [[A]]");
        assert!(report.cancelled);
        assert_eq!(report.text, "[[A]] [[A]]");

        flag.store(false, Ordering::Relaxed);
        let report = localizer.localize_content("[[A]] [[A]]");
        assert!(!report.cancelled);
        assert_eq!(report.text, "[[C]] [[C]]");
    }

    #[test]
    fn annotated_document_rejects_overlaps_and_out_of_range_spans() {
        let mut document = AnnotatedDocument::new("abcdef");
        document.replace(1..3, "X").expect("first edit");
        assert!(document.replace(2..4, "Y").is_err());
        assert!(document.replace(4..10, "Z").is_err());
        document.replace(4..6, "W").expect("disjoint edit");
        assert_eq!(document.edits().len(), 2);
        assert_eq!(document.apply(), "aXdW");
    }

    #[test]
    fn annotated_document_rejects_split_characters() {
        let mut document = AnnotatedDocument::new("مصر");
        assert!(document.replace(1..2, "x").is_err());
    }
}
