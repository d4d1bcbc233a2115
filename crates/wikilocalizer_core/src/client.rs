use std::collections::BTreeMap;
use std::env;
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, trace};

use crate::config::LocalizerConfig;
use crate::gateway::RemoteWikiGateway;
use crate::wikitext::title_key;

#[derive(Debug, Clone)]
pub struct RemotePage {
    pub title: String,
    pub namespace: i32,
    pub page_id: i64,
    pub revision_id: i64,
    pub timestamp: String,
    pub content: String,
}

impl RemotePage {
    pub fn edit_base(&self) -> EditBase {
        EditBase {
            revision_id: self.revision_id,
            timestamp: self.timestamp.clone(),
        }
    }
}

/// Revision a new text was derived from. The save is refused when the page
/// has changed since.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditBase {
    pub revision_id: i64,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    Saved { new_revision_id: Option<i64> },
    Conflict,
}

/// `error` member of an Action API response.
#[derive(Debug, Clone, thiserror::Error)]
#[error("MediaWiki API error [{code}]: {info}")]
pub struct ApiError {
    pub code: String,
    pub info: String,
}

/// Page reads and writes used by the publisher.
pub trait WikiPageApi {
    fn login(&mut self, username: &str, password: &str) -> Result<()>;
    fn get_page(&mut self, title: &str) -> Result<Option<RemotePage>>;
    fn edit_page(
        &mut self,
        title: &str,
        content: &str,
        summary: &str,
        base: &EditBase,
    ) -> Result<EditOutcome>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct MediaWikiClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub rate_limit_write_ms: u64,
    pub max_retries: usize,
    pub max_write_retries: usize,
    pub retry_delay_ms: u64,
}

impl MediaWikiClientConfig {
    pub fn local_from_config(config: &LocalizerConfig) -> Self {
        Self::from_env_with_defaults(config.local_api_url(), config.user_agent())
    }

    pub fn foreign_from_config(config: &LocalizerConfig) -> Self {
        Self::from_env_with_defaults(config.foreign_api_url(), config.user_agent())
    }

    fn from_env_with_defaults(api_url: String, user_agent: String) -> Self {
        Self {
            api_url,
            user_agent,
            timeout_ms: env_value_u64("WIKI_HTTP_TIMEOUT_MS", 30_000),
            rate_limit_read_ms: env_value_u64("WIKI_RATE_LIMIT_READ", 300),
            rate_limit_write_ms: env_value_u64("WIKI_RATE_LIMIT_WRITE", 1_000),
            max_retries: env_value_usize("WIKI_HTTP_RETRIES", 2),
            max_write_retries: env_value_usize("WIKI_HTTP_WRITE_RETRIES", 1),
            retry_delay_ms: env_value_u64("WIKI_HTTP_RETRY_DELAY_MS", 500),
        }
    }
}

pub struct MediaWikiClient {
    client: Client,
    config: MediaWikiClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
    csrf_token: Option<String>,
}

impl MediaWikiClient {
    pub fn new(config: MediaWikiClientConfig) -> Result<Self> {
        Url::parse(&config.api_url)
            .with_context(|| format!("invalid wiki API URL: {}", config.api_url))?;
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .cookie_store(true)
            .build()
            .context("failed to build MediaWiki HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
            csrf_token: None,
        })
    }

    pub fn api_url(&self) -> &str {
        &self.config.api_url
    }

    fn request_json_get(&mut self, params: &[(&str, String)]) -> Result<Value> {
        let base_url = Url::parse(&self.config.api_url)
            .with_context(|| format!("invalid wiki API URL: {}", self.config.api_url))?;
        let pairs = encode_params(params);
        let client = self.client.clone();
        self.send_with_retries(false, || client.get(base_url.clone()).query(&pairs))
    }

    fn request_json_post(&mut self, params: &[(&str, String)], is_write: bool) -> Result<Value> {
        let pairs = encode_params(params);
        let client = self.client.clone();
        let api_url = self.config.api_url.clone();
        self.send_with_retries(is_write, || client.post(&api_url).form(&pairs))
    }

    fn send_with_retries<B>(&mut self, is_write: bool, build: B) -> Result<Value>
    where
        B: Fn() -> RequestBuilder,
    {
        let max_retries = if is_write {
            self.config.max_write_retries
        } else {
            self.config.max_retries
        };

        for attempt in 0..=max_retries {
            self.apply_rate_limit(is_write);
            let response = build()
                .header("User-Agent", self.config.user_agent.clone())
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < max_retries && is_retryable_status(status) {
                            debug!(%status, attempt, "retrying MediaWiki request");
                            self.wait_before_retry(attempt, is_write);
                            continue;
                        }
                        bail!("MediaWiki API request failed with HTTP {status}");
                    }

                    let payload: Value = response
                        .json()
                        .context("failed to decode MediaWiki API JSON response")?;
                    if let Some(error) = payload.get("error") {
                        let code = error
                            .get("code")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown_error");
                        let info = error
                            .get("info")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown info");
                        return Err(ApiError {
                            code: code.to_string(),
                            info: info.to_string(),
                        }
                        .into());
                    }
                    return Ok(payload);
                }
                Err(error) => {
                    if attempt < max_retries && is_retryable_error(&error) {
                        debug!(%error, attempt, "retrying MediaWiki request");
                        self.wait_before_retry(attempt, is_write);
                        continue;
                    }
                    return Err(error).context("failed to call MediaWiki API");
                }
            }
        }

        bail!("MediaWiki API request exhausted retry budget")
    }

    fn apply_rate_limit(&mut self, is_write: bool) {
        let delay = if is_write {
            Duration::from_millis(self.config.rate_limit_write_ms)
        } else {
            Duration::from_millis(self.config.rate_limit_read_ms)
        };
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize, is_write: bool) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        let multiplier = if is_write { 2u64 } else { 1u64 };
        sleep(Duration::from_millis(
            base.saturating_mul(multiplier).saturating_add(jitter),
        ));
    }

    fn ensure_csrf_token(&mut self) -> Result<String> {
        if let Some(token) = &self.csrf_token {
            return Ok(token.clone());
        }
        let response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
        ])?;
        let parsed: TokenQueryResponse =
            serde_json::from_value(response).context("failed to decode csrf token response")?;
        let token = parsed
            .query
            .tokens
            .as_ref()
            .and_then(|tokens| tokens.csrftoken.as_ref())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("failed to get MediaWiki csrf token"))?;
        self.csrf_token = Some(token.clone());
        Ok(token)
    }

    fn query_page_info(&mut self, title: &str) -> Result<Option<PageQueryItem>> {
        let response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("prop", "info".to_string()),
            ("titles", title.to_string()),
        ])?;
        let parsed: QueryResponse =
            serde_json::from_value(response).context("failed to decode page info response")?;
        Ok(parsed.query.pages.into_iter().next())
    }
}

impl RemoteWikiGateway for MediaWikiClient {
    fn page_exists(&mut self, title: &str) -> Result<bool> {
        let page = self.query_page_info(title)?;
        let exists = page.is_some_and(|page| page.exists());
        trace!(%title, exists, api = %self.config.api_url, "page info");
        Ok(exists)
    }

    fn get_redirect_target(&mut self, title: &str) -> Result<Option<String>> {
        let response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("titles", title.to_string()),
            ("redirects", "1".to_string()),
        ])?;
        let parsed: QueryResponse =
            serde_json::from_value(response).context("failed to decode redirect response")?;
        Ok(first_redirect_hop(title, &parsed.query))
    }

    fn get_interlanguage_links(&mut self, title: &str) -> Result<BTreeMap<String, String>> {
        let mut links = BTreeMap::new();
        let mut continue_token: Option<String> = None;

        loop {
            let mut params = vec![
                ("action", "query".to_string()),
                ("prop", "langlinks".to_string()),
                ("titles", title.to_string()),
                ("redirects", "1".to_string()),
                ("lllimit", "max".to_string()),
            ];
            if let Some(token) = &continue_token {
                params.push(("llcontinue", token.clone()));
            }

            let response = self.request_json_get(&params)?;
            let parsed: QueryResponse = serde_json::from_value(response)
                .context("failed to decode langlinks API response")?;
            for page in parsed.query.pages {
                for link in page.langlinks {
                    links.entry(link.lang).or_insert(link.title);
                }
            }

            continue_token = parsed.continuation.and_then(|cont| cont.llcontinue);
            if continue_token.is_none() {
                break;
            }
        }

        Ok(links)
    }
}

impl WikiPageApi for MediaWikiClient {
    fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let token_response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
            ("type", "login".to_string()),
        ])?;
        let token_payload: TokenQueryResponse = serde_json::from_value(token_response)
            .context("failed to decode login token response")?;
        let login_token = token_payload
            .query
            .tokens
            .as_ref()
            .and_then(|tokens| tokens.logintoken.as_ref())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("failed to get MediaWiki login token"))?;

        let login_response = self.request_json_post(
            &[
                ("action", "login".to_string()),
                ("lgname", username.to_string()),
                ("lgpassword", password.to_string()),
                ("lgtoken", login_token),
            ],
            true,
        )?;
        let login_payload: LoginResponse =
            serde_json::from_value(login_response).context("failed to decode login response")?;
        match login_payload.login.result.as_deref() {
            Some("Success") => {
                self.csrf_token = None;
                Ok(())
            }
            other => bail!(
                "MediaWiki login failed: {}",
                login_payload
                    .login
                    .reason
                    .or_else(|| other.map(ToString::to_string))
                    .unwrap_or_else(|| "unknown error".to_string())
            ),
        }
    }

    fn get_page(&mut self, title: &str) -> Result<Option<RemotePage>> {
        let response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("titles", title.to_string()),
            ("prop", "revisions".to_string()),
            ("rvprop", "content|timestamp|ids".to_string()),
            ("rvslots", "main".to_string()),
        ])?;
        let parsed: QueryResponse =
            serde_json::from_value(response).context("failed to decode page content response")?;

        let Some(page) = parsed.query.pages.into_iter().next() else {
            return Ok(None);
        };
        if !page.exists() {
            return Ok(None);
        }
        let Some(revision) = page.revisions.first() else {
            return Ok(None);
        };
        let Some(slot) = revision
            .slots
            .as_ref()
            .and_then(|slots| slots.main.as_ref())
        else {
            return Ok(None);
        };

        Ok(Some(RemotePage {
            title: page.title.clone(),
            namespace: page.ns,
            page_id: page.pageid.unwrap_or_default(),
            revision_id: revision.revid,
            timestamp: revision.timestamp.clone(),
            content: slot.content.clone(),
        }))
    }

    fn edit_page(
        &mut self,
        title: &str,
        content: &str,
        summary: &str,
        base: &EditBase,
    ) -> Result<EditOutcome> {
        let token = self.ensure_csrf_token()?;
        let response = self.request_json_post(
            &[
                ("action", "edit".to_string()),
                ("title", title.to_string()),
                ("text", content.to_string()),
                ("summary", summary.to_string()),
                ("bot", "1".to_string()),
                ("nocreate", "1".to_string()),
                ("baserevid", base.revision_id.to_string()),
                ("basetimestamp", base.timestamp.clone()),
                ("token", token),
            ],
            true,
        );
        let response = match response {
            Ok(response) => response,
            Err(error) if is_edit_conflict(&error) => {
                debug!(%title, base_revision = base.revision_id, "edit conflict");
                return Ok(EditOutcome::Conflict);
            }
            Err(error) => return Err(error),
        };
        let edit_payload: EditResponse =
            serde_json::from_value(response).context("failed to decode edit response")?;
        let edit = edit_payload
            .edit
            .ok_or_else(|| anyhow::anyhow!("missing edit payload in API response"))?;
        if edit.result.as_deref() != Some("Success") {
            bail!(
                "MediaWiki edit failed for {}: {}",
                title,
                edit.result.unwrap_or_else(|| "unknown".to_string())
            );
        }
        Ok(EditOutcome::Saved {
            new_revision_id: edit.newrevid,
        })
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

fn encode_params(params: &[(&str, String)]) -> Vec<(String, String)> {
    let mut pairs = Vec::with_capacity(params.len() + 2);
    pairs.push(("format".to_string(), "json".to_string()));
    pairs.push(("formatversion".to_string(), "2".to_string()));
    for (key, value) in params {
        if !value.is_empty() {
            pairs.push(((*key).to_string(), value.clone()));
        }
    }
    pairs
}

/// The hop whose source is `title`, after the API's own title normalization.
/// With `redirects=1` the API reports the whole chain; only the first hop is
/// returned so the caller can do its own loop detection.
fn first_redirect_hop(title: &str, query: &QueryPayload) -> Option<String> {
    let requested = query
        .normalized
        .iter()
        .find(|entry| title_key(&entry.from) == title_key(title))
        .map_or(title, |entry| entry.to.as_str());
    query
        .redirects
        .iter()
        .find(|entry| title_key(&entry.from) == title_key(requested))
        .map(|entry| match entry.tofragment.as_deref() {
            Some(fragment) if !fragment.is_empty() => format!("{}#{fragment}", entry.to),
            _ => entry.to.clone(),
        })
}

fn env_value_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_value_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_edit_conflict(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<ApiError>()
        .is_some_and(|api| api.code == "editconflict")
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[derive(Debug, Deserialize, Default)]
struct QueryResponse {
    #[serde(default)]
    query: QueryPayload,
    #[serde(default, rename = "continue")]
    continuation: Option<ContinuationPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct QueryPayload {
    #[serde(default)]
    normalized: Vec<TitleMapping>,
    #[serde(default)]
    redirects: Vec<TitleMapping>,
    #[serde(default)]
    pages: Vec<PageQueryItem>,
}

#[derive(Debug, Deserialize, Default)]
struct ContinuationPayload {
    llcontinue: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TitleMapping {
    from: String,
    to: String,
    tofragment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PageQueryItem {
    pageid: Option<i64>,
    #[serde(default)]
    ns: i32,
    title: String,
    #[serde(default)]
    missing: bool,
    #[serde(default)]
    invalid: bool,
    #[serde(default)]
    revisions: Vec<RevisionQueryItem>,
    #[serde(default)]
    langlinks: Vec<LangLinkItem>,
}

impl PageQueryItem {
    fn exists(&self) -> bool {
        !self.missing && !self.invalid
    }
}

#[derive(Debug, Deserialize)]
struct RevisionQueryItem {
    revid: i64,
    timestamp: String,
    slots: Option<RevisionSlotContainer>,
}

#[derive(Debug, Deserialize)]
struct RevisionSlotContainer {
    main: Option<RevisionMainSlot>,
}

#[derive(Debug, Deserialize)]
struct RevisionMainSlot {
    content: String,
}

#[derive(Debug, Deserialize)]
struct LangLinkItem {
    lang: String,
    title: String,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryResponse {
    #[serde(default)]
    query: TokenQueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryPayload {
    tokens: Option<TokenPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenPayload {
    logintoken: Option<String>,
    csrftoken: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LoginResponse {
    #[serde(default)]
    login: LoginPayload,
}

#[derive(Debug, Deserialize, Default)]
struct LoginPayload {
    result: Option<String>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct EditResponse {
    edit: Option<EditPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct EditPayload {
    result: Option<String>,
    newrevid: Option<i64>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn parse(payload: Value) -> QueryResponse {
        serde_json::from_value(payload).expect("decode query response")
    }

    #[test]
    fn page_info_distinguishes_missing_invalid_and_existing() {
        let parsed = parse(json!({
            "query": {
                "pages": [
                    {"ns": 0, "title": "Missing", "missing": true},
                    {"title": "Bad<title", "invalid": true, "invalidreason": "x"},
                    {"pageid": 7, "ns": 0, "title": "Present", "redirect": true}
                ]
            }
        }));
        let flags: Vec<bool> = parsed.query.pages.iter().map(PageQueryItem::exists).collect();
        assert_eq!(flags, vec![false, false, true]);
    }

    #[test]
    fn first_redirect_hop_uses_normalized_title() {
        let parsed = parse(json!({
            "query": {
                "normalized": [{"from": "a_page", "to": "A page"}],
                "redirects": [
                    {"from": "A page", "to": "B"},
                    {"from": "B", "to": "C", "tofragment": "History"}
                ],
                "pages": [{"pageid": 3, "ns": 0, "title": "C"}]
            }
        }));
        assert_eq!(
            first_redirect_hop("a_page", &parsed.query).as_deref(),
            Some("B")
        );
        assert_eq!(
            first_redirect_hop("B", &parsed.query).as_deref(),
            Some("C#History")
        );
        assert_eq!(first_redirect_hop("C", &parsed.query), None);
    }

    #[test]
    fn langlinks_and_continuation_decode() {
        let parsed = parse(json!({
            "continue": {"llcontinue": "123|fr", "continue": "||"},
            "query": {
                "pages": [{
                    "pageid": 1, "ns": 0, "title": "Egypt",
                    "langlinks": [
                        {"lang": "ar", "title": "مصر"},
                        {"lang": "de", "title": "Ägypten"}
                    ]
                }]
            }
        }));
        assert_eq!(
            parsed
                .continuation
                .as_ref()
                .and_then(|cont| cont.llcontinue.as_deref()),
            Some("123|fr")
        );
        let page = &parsed.query.pages[0];
        assert_eq!(page.langlinks.len(), 2);
        assert_eq!(page.langlinks[0].lang, "ar");
        assert_eq!(page.langlinks[0].title, "مصر");
    }

    #[test]
    fn encode_params_adds_format_and_drops_empty_values() {
        let pairs = encode_params(&[
            ("action", "query".to_string()),
            ("titles", String::new()),
        ]);
        assert_eq!(
            pairs,
            vec![
                ("format".to_string(), "json".to_string()),
                ("formatversion".to_string(), "2".to_string()),
                ("action".to_string(), "query".to_string()),
            ]
        );
    }

    #[test]
    fn client_rejects_invalid_api_url() {
        let config = MediaWikiClientConfig {
            api_url: "not a url".to_string(),
            user_agent: "test".to_string(),
            timeout_ms: 1_000,
            rate_limit_read_ms: 0,
            rate_limit_write_ms: 0,
            max_retries: 0,
            max_write_retries: 0,
            retry_delay_ms: 0,
        };
        let error = MediaWikiClient::new(config)
            .err()
            .expect("invalid URL must fail");
        assert!(error.to_string().contains("invalid wiki API URL"));
    }

    #[test]
    fn edit_conflict_is_recognized_by_api_error_code() {
        let conflict: anyhow::Error = ApiError {
            code: "editconflict".to_string(),
            info: "Edit conflict.".to_string(),
        }
        .into();
        assert!(is_edit_conflict(&conflict));
        assert!(is_edit_conflict(&conflict.context("failed to save")));

        let other: anyhow::Error = ApiError {
            code: "protectedpage".to_string(),
            info: "protected".to_string(),
        }
        .into();
        assert!(!is_edit_conflict(&other));
        assert!(!is_edit_conflict(&anyhow::anyhow!("editconflict")));
    }

    #[test]
    fn edit_response_carries_new_revision() {
        let parsed: EditResponse = serde_json::from_value(json!({
            "edit": {"result": "Success", "pageid": 5, "newrevid": 201}
        }))
        .expect("decode edit response");
        let edit = parsed.edit.expect("edit payload");
        assert_eq!(edit.newrevid, Some(201));
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
    }
}
