use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::DEFAULT_MAX_REDIRECT_HOPS;
use crate::gateway::RemoteWikiGateway;
use crate::wikitext::{has_invalid_title_chars, normalize_title, title_key};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResolutionOutcome {
    /// The page, or the end of its redirect chain, exists on the local wiki.
    LocalFound { resolved_title: String },
    /// Only the foreign wiki has the page and it links to no local article.
    ForeignOnly { foreign_title: String },
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WikiSide {
    Local,
    Foreign,
}

impl WikiSide {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Foreign => "foreign",
        }
    }
}

impl fmt::Display for WikiSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("{side} wiki request failed for {title}: {message}")]
    Transport {
        side: WikiSide,
        title: String,
        message: String,
    },
    #[error("circular redirect at {title} (chain: {})", .chain.join(" -> "))]
    CircularRedirect { title: String, chain: Vec<String> },
    #[error("redirect chain from {title} exceeds {limit} hops")]
    RedirectLimit { title: String, limit: usize },
    #[error("malformed link target {target:?}")]
    MalformedLink { target: String },
}

/// Outcome of one lookup plus every failure met on the way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub outcome: ResolutionOutcome,
    pub errors: Vec<ResolveError>,
}

impl Resolution {
    fn settled(outcome: ResolutionOutcome, errors: Vec<ResolveError>) -> Self {
        Self { outcome, errors }
    }
}

/// Decides where a link target should point on the local wiki.
///
/// The order is fixed: local page (through redirects), then the foreign
/// page's inter-language link to the local language, then the foreign page
/// itself. Failures never escape; they fold into `NotFound` or into the next
/// fallback and are returned alongside the outcome.
pub struct LangLinkResolver<L, F> {
    local: L,
    foreign: F,
    local_lang: String,
    max_redirect_hops: usize,
}

impl<L: RemoteWikiGateway, F: RemoteWikiGateway> LangLinkResolver<L, F> {
    pub fn new(local: L, foreign: F, local_lang: impl Into<String>) -> Self {
        Self {
            local,
            foreign,
            local_lang: local_lang.into(),
            max_redirect_hops: DEFAULT_MAX_REDIRECT_HOPS,
        }
    }

    pub fn with_max_redirect_hops(mut self, hops: usize) -> Self {
        self.max_redirect_hops = hops.max(1);
        self
    }

    pub fn local_lang(&self) -> &str {
        &self.local_lang
    }

    pub fn resolve(&mut self, target: &str) -> Resolution {
        let title = match clean_title(target) {
            Ok(title) => title,
            Err(error) => {
                warn!(link_target = target, "skipping malformed link");
                return Resolution::settled(ResolutionOutcome::NotFound, vec![error]);
            }
        };

        let mut errors = Vec::new();
        match self.resolve_local(&title) {
            Ok(Some(resolved_title)) => {
                debug!(%title, %resolved_title, "found on local wiki");
                return Resolution::settled(
                    ResolutionOutcome::LocalFound { resolved_title },
                    errors,
                );
            }
            Ok(None) => {}
            Err(error) => {
                warn!(%title, %error, "local lookup failed");
                let stop = !matches!(error, ResolveError::Transport { .. });
                errors.push(error);
                if stop {
                    return Resolution::settled(ResolutionOutcome::NotFound, errors);
                }
            }
        }

        let outcome = match self.resolve_foreign(&title) {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(%title, %error, "foreign lookup failed");
                errors.push(error);
                ResolutionOutcome::NotFound
            }
        };
        debug!(%title, ?outcome, "resolved through foreign wiki");
        Resolution::settled(outcome, errors)
    }

    /// Follow local redirects until a terminal page. `Ok(None)` when the
    /// chain ends at a missing page.
    fn resolve_local(&mut self, title: &str) -> Result<Option<String>, ResolveError> {
        let mut visited = BTreeSet::new();
        let mut chain = Vec::new();
        let mut current = title.to_string();

        loop {
            if !visited.insert(title_key(&current)) {
                chain.push(current.clone());
                return Err(ResolveError::CircularRedirect {
                    title: current,
                    chain,
                });
            }
            if chain.len() > self.max_redirect_hops {
                return Err(ResolveError::RedirectLimit {
                    title: title.to_string(),
                    limit: self.max_redirect_hops,
                });
            }
            chain.push(current.clone());

            let exists = self
                .local
                .page_exists(&current)
                .map_err(|error| transport(WikiSide::Local, &current, &error))?;
            if !exists {
                return Ok(None);
            }

            let next = self
                .local
                .get_redirect_target(&current)
                .map_err(|error| transport(WikiSide::Local, &current, &error))?;
            match next.map(|value| strip_fragment(&value)) {
                Some(next) if !next.is_empty() => current = next,
                _ => return Ok(Some(normalize_title(&current))),
            }
        }
    }

    fn resolve_foreign(&mut self, title: &str) -> Result<ResolutionOutcome, ResolveError> {
        let exists = self
            .foreign
            .page_exists(title)
            .map_err(|error| transport(WikiSide::Foreign, title, &error))?;
        if !exists {
            return Ok(ResolutionOutcome::NotFound);
        }

        let langlinks = self
            .foreign
            .get_interlanguage_links(title)
            .map_err(|error| transport(WikiSide::Foreign, title, &error))?;
        let local_title = langlinks
            .get(&self.local_lang)
            .map(|value| normalize_title(value))
            .filter(|value| !value.is_empty());

        Ok(match local_title {
            Some(resolved_title) => ResolutionOutcome::LocalFound { resolved_title },
            None => ResolutionOutcome::ForeignOnly {
                foreign_title: title.to_string(),
            },
        })
    }
}

/// Strip `[[...]]`, keep the part before `|`, drop a `#fragment` and
/// normalize spacing.
pub fn clean_title(target: &str) -> Result<String, ResolveError> {
    let mut value = target.trim();
    if let Some(inner) = value
        .strip_prefix("[[")
        .and_then(|rest| rest.strip_suffix("]]"))
    {
        value = inner;
    }
    if let Some((before_pipe, _)) = value.split_once('|') {
        value = before_pipe;
    }

    let title = strip_fragment(value);
    if title.is_empty() || has_invalid_title_chars(&title) {
        return Err(ResolveError::MalformedLink {
            target: target.to_string(),
        });
    }
    Ok(title)
}

fn strip_fragment(value: &str) -> String {
    let without_fragment = value.split_once('#').map_or(value, |(title, _)| title);
    normalize_title(without_fragment)
}

fn transport(side: WikiSide, title: &str, error: &anyhow::Error) -> ResolveError {
    ResolveError::Transport {
        side,
        title: title.to_string(),
        message: format!("{error:#}"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::gateway::testing::StubWiki;

    fn resolver(local: StubWiki, foreign: StubWiki) -> LangLinkResolver<StubWiki, StubWiki> {
        LangLinkResolver::new(local, foreign, "ar")
    }

    #[test]
    fn clean_title_strips_brackets_pipe_and_fragment() {
        assert_eq!(clean_title("[[Foo_bar|label]]").expect("clean"), "Foo bar");
        assert_eq!(clean_title(" Foo#History ").expect("clean"), "Foo");
        assert!(matches!(
            clean_title("[[|label]]"),
            Err(ResolveError::MalformedLink { .. })
        ));
        assert!(matches!(
            clean_title("{{PAGENAME}}"),
            Err(ResolveError::MalformedLink { .. })
        ));
    }

    #[test]
    fn direct_local_page_is_found() {
        let mut resolver = resolver(StubWiki::with_pages(&["مصر"]), StubWiki::default());
        let resolution = resolver.resolve("مصر");
        assert_eq!(
            resolution.outcome,
            ResolutionOutcome::LocalFound {
                resolved_title: "مصر".to_string()
            }
        );
        assert!(resolution.errors.is_empty());
    }

    #[test]
    fn redirect_chain_resolves_to_terminal_page() {
        let local = StubWiki::with_pages(&["C"])
            .redirect("A", "B")
            .redirect("B", "C");
        let mut resolver = resolver(local, StubWiki::default());
        assert_eq!(
            resolver.resolve("A").outcome,
            ResolutionOutcome::LocalFound {
                resolved_title: "C".to_string()
            }
        );
    }

    #[test]
    fn redirect_to_section_drops_fragment() {
        let local = StubWiki::with_pages(&["Target page"]).redirect("Alias", "Target_page#Early life");
        let mut resolver = resolver(local, StubWiki::default());
        assert_eq!(
            resolver.resolve("Alias").outcome,
            ResolutionOutcome::LocalFound {
                resolved_title: "Target page".to_string()
            }
        );
    }

    #[test]
    fn circular_redirect_terminates_as_not_found() {
        let local = StubWiki::default().redirect("A", "B").redirect("B", "A");
        let foreign = StubWiki::with_pages(&["A"]);
        let (sender, receiver) = mpsc::channel();
        thread::spawn(move || {
            let mut resolver = resolver(local, foreign);
            let _ = sender.send(resolver.resolve("A"));
        });

        let resolution = receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("resolution must finish");
        assert_eq!(resolution.outcome, ResolutionOutcome::NotFound);
        assert!(matches!(
            resolution.errors.as_slice(),
            [ResolveError::CircularRedirect { title, .. }] if title == "A"
        ));
    }

    #[test]
    fn overlong_redirect_chain_hits_hop_limit() {
        let mut local = StubWiki::with_pages(&["P5"]);
        for index in 0..5 {
            local = local.redirect(&format!("P{index}"), &format!("P{}", index + 1));
        }
        let mut resolver = resolver(local, StubWiki::default()).with_max_redirect_hops(2);
        let resolution = resolver.resolve("P0");
        assert_eq!(resolution.outcome, ResolutionOutcome::NotFound);
        assert!(matches!(
            resolution.errors.as_slice(),
            [ResolveError::RedirectLimit { limit: 2, .. }]
        ));
    }

    #[test]
    fn foreign_langlink_to_local_language_wins() {
        let foreign = StubWiki::with_pages(&["Egypt"]).langlink("Egypt", "ar", "مصر_العربية");
        let mut resolver = resolver(StubWiki::default(), foreign);
        assert_eq!(
            resolver.resolve("Egypt").outcome,
            ResolutionOutcome::LocalFound {
                resolved_title: "مصر العربية".to_string()
            }
        );
    }

    #[test]
    fn foreign_page_without_local_langlink_is_foreign_only() {
        let foreign = StubWiki::with_pages(&["Bar"]).langlink("Bar", "fr", "Barre");
        let mut resolver = resolver(StubWiki::default(), foreign);
        assert_eq!(
            resolver.resolve("[[Bar|baz]]").outcome,
            ResolutionOutcome::ForeignOnly {
                foreign_title: "Bar".to_string()
            }
        );
    }

    #[test]
    fn missing_everywhere_is_not_found() {
        let mut resolver = resolver(StubWiki::default(), StubWiki::default());
        let resolution = resolver.resolve("Nowhere");
        assert_eq!(resolution.outcome, ResolutionOutcome::NotFound);
        assert!(resolution.errors.is_empty());
    }

    #[test]
    fn local_transport_failure_falls_through_to_foreign() {
        let local = StubWiki::with_pages(&["Bar"]).failing("Bar");
        let foreign = StubWiki::with_pages(&["Bar"]);
        let mut resolver = resolver(local, foreign);
        let resolution = resolver.resolve("Bar");
        assert_eq!(
            resolution.outcome,
            ResolutionOutcome::ForeignOnly {
                foreign_title: "Bar".to_string()
            }
        );
        assert!(matches!(
            resolution.errors.as_slice(),
            [ResolveError::Transport {
                side: WikiSide::Local,
                ..
            }]
        ));
    }

    #[test]
    fn foreign_transport_failure_is_not_found() {
        let foreign = StubWiki::with_pages(&["Bar"]).failing("Bar");
        let mut resolver = resolver(StubWiki::default(), foreign);
        let resolution = resolver.resolve("Bar");
        assert_eq!(resolution.outcome, ResolutionOutcome::NotFound);
        assert_eq!(resolution.errors.len(), 1);
        assert!(resolution.errors[0].to_string().contains("foreign wiki request failed"));
    }

    #[test]
    fn borrowed_gateways_see_one_lookup_per_hop() {
        let mut local = StubWiki::with_pages(&["B"]).redirect("A", "B");
        let mut foreign = StubWiki::default();
        {
            let mut resolver = LangLinkResolver::new(&mut local, &mut foreign, "ar");
            resolver.resolve("A");
        }
        assert_eq!(local.request_count, 4);
        assert_eq!(foreign.request_count, 0);
    }

    #[test]
    fn visited_set_does_not_leak_between_calls() {
        let local = StubWiki::with_pages(&["B"]).redirect("A", "B");
        let mut resolver = resolver(local, StubWiki::default());
        for _ in 0..2 {
            assert_eq!(
                resolver.resolve("A").outcome,
                ResolutionOutcome::LocalFound {
                    resolved_title: "B".to_string()
                }
            );
        }
    }
}
