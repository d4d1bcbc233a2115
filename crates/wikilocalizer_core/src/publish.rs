use std::env;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use similar::TextDiff;
use tracing::{info, warn};

use crate::client::{EditOutcome, RemotePage, WikiPageApi};
use crate::gateway::RemoteWikiGateway;
use crate::localizer::{LocalizeReport, LocalizerSettings, WikiLocalizer};

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// WIKI_BOT_USER / WIKI_BOT_PASS, or `None` when either is unset or blank.
    pub fn from_env() -> Option<Self> {
        let username = env::var("WIKI_BOT_USER").ok()?;
        let password = env::var("WIKI_BOT_PASS").ok()?;
        if username.trim().is_empty() || password.trim().is_empty() {
            return None;
        }
        Some(Self {
            username: username.trim().to_string(),
            password: password.trim().to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub save: bool,
    pub summary: String,
    pub settings: LocalizerSettings,
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PublishStatus {
    Saved,
    Unchanged,
    DryRun,
    SkippedMissingCredentials,
    /// The page changed between the read and the save; nothing was written.
    EditConflict,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishReport {
    pub title: String,
    pub status: PublishStatus,
    pub revision_id: i64,
    pub new_revision_id: Option<i64>,
    pub links_seen: usize,
    pub links_replaced: usize,
    pub fallbacks: usize,
    pub errors: Vec<String>,
    pub diff: String,
    pub request_count: usize,
}

/// Localize one page of the local wiki and, when asked, save the result.
pub fn localize_page<A, F>(
    api: &mut A,
    foreign: &mut F,
    title: &str,
    options: &PublishOptions,
) -> Result<PublishReport>
where
    A: WikiPageApi + RemoteWikiGateway,
    F: RemoteWikiGateway,
{
    let page = api
        .get_page(title)
        .with_context(|| format!("failed to read {title}"))?;
    let Some(page) = page else {
        bail!("page does not exist on the local wiki: {title}");
    };

    let report = {
        let mut localizer = WikiLocalizer::new(&mut *api, &mut *foreign, &options.settings);
        localizer.localize_content(&page.content)
    };
    let diff = render_diff(&page.title, &page.content, &report.text);

    let mut new_revision_id = None;
    let status = if report.text == page.content {
        PublishStatus::Unchanged
    } else if !options.save {
        PublishStatus::DryRun
    } else {
        match &options.credentials {
            None => {
                warn!(title = %page.title, "WIKI_BOT_USER/WIKI_BOT_PASS not set; not saving");
                PublishStatus::SkippedMissingCredentials
            }
            Some(credentials) => {
                api.login(&credentials.username, &credentials.password)
                    .context("login failed")?;
                let outcome = api
                    .edit_page(&page.title, &report.text, &options.summary, &page.edit_base())
                    .with_context(|| format!("failed to save {}", page.title))?;
                match outcome {
                    EditOutcome::Saved {
                        new_revision_id: revision,
                    } => {
                        info!(title = %page.title, ?revision, "saved localized page");
                        new_revision_id = revision;
                        PublishStatus::Saved
                    }
                    EditOutcome::Conflict => {
                        warn!(
                            title = %page.title,
                            base_revision = page.revision_id,
                            "page changed while localizing; not saving"
                        );
                        PublishStatus::EditConflict
                    }
                }
            }
        }
    };

    Ok(build_report(
        &page,
        status,
        new_revision_id,
        report,
        diff,
        api.request_count(),
    ))
}

/// Unified diff between the original and the localized text; empty when equal.
pub fn render_diff(title: &str, before: &str, after: &str) -> String {
    if before == after {
        return String::new();
    }
    TextDiff::from_lines(before, after)
        .unified_diff()
        .context_radius(2)
        .header(&format!("{title} (current)"), &format!("{title} (localized)"))
        .to_string()
}

fn build_report(
    page: &RemotePage,
    status: PublishStatus,
    new_revision_id: Option<i64>,
    report: LocalizeReport,
    diff: String,
    request_count: usize,
) -> PublishReport {
    PublishReport {
        title: page.title.clone(),
        status,
        revision_id: page.revision_id,
        new_revision_id,
        links_seen: report.links_seen,
        links_replaced: report.links_replaced,
        fallbacks: report.fallbacks,
        errors: report.errors,
        diff,
        request_count,
    }
}
