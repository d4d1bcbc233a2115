use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "wikilocalizer/0.1";
pub const DEFAULT_LOCAL_API_URL: &str = "https://ar.wikipedia.org/w/api.php";
pub const DEFAULT_FOREIGN_API_URL: &str = "https://en.wikipedia.org/w/api.php";
pub const DEFAULT_LOCAL_LANG: &str = "ar";
pub const DEFAULT_FALLBACK_TEMPLATE: &str = "وإو";
pub const DEFAULT_EDIT_SUMMARY: &str = "بوت: توطين الوصلات الداخلية";
pub const DEFAULT_MAX_REDIRECT_HOPS: usize = 32;

pub const CONFIG_DIR_NAME: &str = ".wikilocalizer";
pub const CONFIG_FILENAME: &str = "config.toml";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct LocalizerConfig {
    #[serde(default)]
    pub local: LocalWikiSection,
    #[serde(default)]
    pub foreign: ForeignWikiSection,
    #[serde(default)]
    pub localizer: LocalizerSection,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct LocalWikiSection {
    pub api_url: Option<String>,
    pub lang: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ForeignWikiSection {
    pub api_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct LocalizerSection {
    pub fallback_template: Option<String>,
    pub edit_summary: Option<String>,
    pub max_redirect_hops: Option<usize>,
}

impl LocalizerConfig {
    /// Local wiki API URL: env LOCAL_WIKI_API_URL > config > ar.wikipedia.org.
    pub fn local_api_url(&self) -> String {
        env_override("LOCAL_WIKI_API_URL")
            .or_else(|| self.local.api_url.clone())
            .unwrap_or_else(|| DEFAULT_LOCAL_API_URL.to_string())
    }

    /// Foreign wiki API URL: env FOREIGN_WIKI_API_URL > config > en.wikipedia.org.
    pub fn foreign_api_url(&self) -> String {
        env_override("FOREIGN_WIKI_API_URL")
            .or_else(|| self.foreign.api_url.clone())
            .unwrap_or_else(|| DEFAULT_FOREIGN_API_URL.to_string())
    }

    /// Language code that inter-language links must carry to count as local.
    pub fn local_lang(&self) -> String {
        env_override("LOCAL_WIKI_LANG")
            .or_else(|| self.local.lang.clone())
            .unwrap_or_else(|| DEFAULT_LOCAL_LANG.to_string())
    }

    /// Resolve user agent: env WIKI_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        env_override("WIKI_USER_AGENT")
            .or_else(|| self.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn fallback_template(&self) -> &str {
        self.localizer
            .fallback_template
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_FALLBACK_TEMPLATE)
    }

    pub fn edit_summary(&self) -> String {
        env_override("WIKILOCALIZER_EDIT_SUMMARY")
            .or_else(|| self.localizer.edit_summary.clone())
            .unwrap_or_else(|| DEFAULT_EDIT_SUMMARY.to_string())
    }

    pub fn max_redirect_hops(&self) -> usize {
        self.localizer
            .max_redirect_hops
            .filter(|hops| *hops > 0)
            .unwrap_or(DEFAULT_MAX_REDIRECT_HOPS)
    }

    pub fn diagnostics(&self) -> String {
        format!(
            "local_api_url={}\nlocal_lang={}\nforeign_api_url={}\nuser_agent={}\nfallback_template={}\nmax_redirect_hops={}",
            self.local_api_url(),
            self.local_lang(),
            self.foreign_api_url(),
            self.user_agent(),
            self.fallback_template(),
            self.max_redirect_hops(),
        )
    }
}

/// `<cwd>/.wikilocalizer/config.toml`, or WIKILOCALIZER_CONFIG when set.
pub fn default_config_path(cwd: &Path) -> PathBuf {
    match env_override("WIKILOCALIZER_CONFIG") {
        Some(value) => {
            let path = PathBuf::from(value);
            if path.is_absolute() {
                path
            } else {
                cwd.join(path)
            }
        }
        None => cwd.join(CONFIG_DIR_NAME).join(CONFIG_FILENAME),
    }
}

/// Load and parse a LocalizerConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<LocalizerConfig> {
    if !config_path.exists() {
        return Ok(LocalizerConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: LocalizerConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn env_override(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
