#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fmt, fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_SUCCESS_QUOTA: usize = 1;
pub const DEFAULT_SKIP_BUDGET: usize = 5;
pub const DEFAULT_RETRY_BUDGET: u32 = 3;
pub const DEFAULT_MAX_CHECKS: usize = 200;
pub const DEFAULT_DROPBOX_FOLDER: &str = "/relay";
pub const DEFAULT_YOUTUBE_PRIVACY: &str = "private";
pub const DEFAULT_TARGET_LANGUAGE: &str = "en";
pub const DEFAULT_TRANSLATOR_CHAIN: &str = "google,libre,mymemory,transliterate";
pub const DEFAULT_LIBRETRANSLATE_URL: &str = "https://libretranslate.com/translate";
pub const DEFAULT_GIT_BRANCH: &str = "main";
pub const DEFAULT_YT_DLP: &str = "yt-dlp";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/116.0.0.0 Safari/537.36";

/// Errors that abort a run before any discovery starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} not set")]
    MissingValue(&'static str),
    #[error("{destination} destination requires {}", .missing.join(", "))]
    MissingCredentials {
        destination: &'static str,
        missing: Vec<&'static str>,
    },
    #[error("unknown destination: {0} (expected dropbox or youtube)")]
    UnknownDestination(String),
    #[error("unknown translator in chain: {0}")]
    UnknownTranslator(String),
}

/// A credential that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropboxCredentials {
    pub app_key: Secret,
    pub app_secret: Secret,
    pub refresh_token: Secret,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YoutubeCredentials {
    pub client_id: Secret,
    pub client_secret: Secret,
    pub refresh_token: Secret,
}

/// Which upload adapter the run uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationConfig {
    Dropbox {
        folder: String,
        credentials: DropboxCredentials,
    },
    Youtube {
        privacy: String,
        credentials: YoutubeCredentials,
    },
}

impl DestinationConfig {
    pub fn label(&self) -> &'static str {
        match self {
            DestinationConfig::Dropbox { .. } => "dropbox",
            DestinationConfig::Youtube { .. } => "youtube",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslatorKind {
    Google,
    Libre,
    MyMemory,
    Transliterate,
}

impl TranslatorKind {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "google" | "googletrans" => Ok(TranslatorKind::Google),
            "libre" | "libretranslate" => Ok(TranslatorKind::Libre),
            "mymemory" => Ok(TranslatorKind::MyMemory),
            "transliterate" | "unidecode" => Ok(TranslatorKind::Transliterate),
            _ => Err(ConfigError::UnknownTranslator(value.trim().to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationConfig {
    pub chain: Vec<TranslatorKind>,
    pub target_language: String,
    pub libre_url: String,
    pub libre_api_key: Option<Secret>,
}

/// Where (and whether) ledger files are pushed after each save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitRemote {
    pub token: Secret,
    pub repository: String,
    pub branch: String,
}

/// Everything a run needs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub channel_url: String,
    pub success_quota: usize,
    pub skip_budget: usize,
    pub retry_budget: u32,
    pub max_checks: usize,
    pub destination: DestinationConfig,
    pub translation: TranslationConfig,
    pub cookies: Option<Secret>,
    pub user_agent: String,
    pub state_dir: PathBuf,
    pub work_dir: PathBuf,
    pub git_remote: Option<GitRemote>,
    pub yt_dlp: PathBuf,
}

/// Values supplied on the command line. They win over env and file.
#[derive(Debug, Clone, Default)]
pub struct RelayOverrides {
    pub channel_url: Option<String>,
    pub success_quota: Option<usize>,
    pub skip_budget: Option<usize>,
    pub retry_budget: Option<u32>,
    pub state_dir: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_config(overrides: RelayOverrides) -> Result<RelayConfig> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    let config = build_config_with_overrides(&file_vars, process_env, overrides)?;
    Ok(config)
}

#[cfg(test)]
fn build_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RelayConfig, ConfigError> {
    build_config_with_overrides(file_vars, env_lookup, RelayOverrides::default())
}

fn build_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RelayOverrides,
) -> Result<RelayConfig, ConfigError> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let channel_url = overrides
        .channel_url
        .filter(|value| !value.trim().is_empty())
        .or_else(|| lookup("CHANNEL_URL"))
        .ok_or(ConfigError::MissingValue("CHANNEL_URL"))?;

    let success_quota = overrides
        .success_quota
        .filter(|value| *value > 0)
        .or_else(|| positive(lookup("MAX_VIDEOS")))
        .unwrap_or(DEFAULT_SUCCESS_QUOTA);
    // Zero is a legitimate skip budget: it stops before the first candidate.
    let skip_budget = overrides
        .skip_budget
        .or_else(|| lookup("SKIP_LIMIT").and_then(|value| value.parse::<usize>().ok()))
        .unwrap_or(DEFAULT_SKIP_BUDGET);
    let retry_budget = overrides
        .retry_budget
        .filter(|value| *value > 0)
        .or_else(|| positive(lookup("DOWNLOAD_RETRIES")))
        .unwrap_or(DEFAULT_RETRY_BUDGET);
    let max_checks = positive(lookup("MAX_CHECKS")).unwrap_or(DEFAULT_MAX_CHECKS);

    let destination = build_destination(&lookup)?;
    let translation = build_translation(&lookup)?;

    let git_remote = match lookup("GIT_TOKEN") {
        Some(token) => {
            let repository =
                lookup("GIT_REPOSITORY").ok_or(ConfigError::MissingValue("GIT_REPOSITORY"))?;
            let branch = lookup("GIT_BRANCH")
                .map(|value| {
                    value
                        .strip_prefix("refs/heads/")
                        .unwrap_or(&value)
                        .to_string()
                })
                .unwrap_or_else(|| DEFAULT_GIT_BRANCH.to_string());
            Some(GitRemote {
                token: Secret::new(token),
                repository,
                branch,
            })
        }
        None => None,
    };

    Ok(RelayConfig {
        channel_url,
        success_quota,
        skip_budget,
        retry_budget,
        max_checks,
        destination,
        translation,
        cookies: lookup("CHANNEL_COOKIES").map(Secret::new),
        user_agent: lookup("USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
        state_dir: overrides
            .state_dir
            .or_else(|| lookup("STATE_DIR").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(".")),
        work_dir: overrides
            .work_dir
            .or_else(|| lookup("WORK_DIR").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(".")),
        git_remote,
        yt_dlp: lookup("YT_DLP")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_YT_DLP)),
    })
}

fn build_destination(
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<DestinationConfig, ConfigError> {
    let kind = lookup("DESTINATION").unwrap_or_else(|| "dropbox".to_string());
    match kind.to_ascii_lowercase().as_str() {
        "dropbox" => {
            let [app_key, app_secret, refresh_token] = require_all(
                "dropbox",
                lookup,
                ["DROPBOX_APP_KEY", "DROPBOX_APP_SECRET", "DROPBOX_REFRESH_TOKEN"],
            )?;
            let folder = lookup("DROPBOX_FOLDER")
                .unwrap_or_else(|| DEFAULT_DROPBOX_FOLDER.to_string());
            Ok(DestinationConfig::Dropbox {
                folder: normalize_folder(&folder),
                credentials: DropboxCredentials {
                    app_key,
                    app_secret,
                    refresh_token,
                },
            })
        }
        "youtube" => {
            let [client_id, client_secret, refresh_token] = require_all(
                "youtube",
                lookup,
                [
                    "YOUTUBE_CLIENT_ID",
                    "YOUTUBE_CLIENT_SECRET",
                    "YOUTUBE_REFRESH_TOKEN",
                ],
            )?;
            Ok(DestinationConfig::Youtube {
                privacy: lookup("YOUTUBE_PRIVACY")
                    .unwrap_or_else(|| DEFAULT_YOUTUBE_PRIVACY.to_string()),
                credentials: YoutubeCredentials {
                    client_id,
                    client_secret,
                    refresh_token,
                },
            })
        }
        _ => Err(ConfigError::UnknownDestination(kind)),
    }
}

fn require_all<const N: usize>(
    destination: &'static str,
    lookup: &impl Fn(&str) -> Option<String>,
    keys: [&'static str; N],
) -> Result<[Secret; N], ConfigError> {
    let values = keys.map(|key| lookup(key));
    let missing: Vec<&'static str> = keys
        .iter()
        .zip(values.iter())
        .filter(|(_, value)| value.is_none())
        .map(|(key, _)| *key)
        .collect();
    if !missing.is_empty() {
        return Err(ConfigError::MissingCredentials {
            destination,
            missing,
        });
    }
    Ok(values.map(|value| Secret::new(value.unwrap_or_default())))
}

fn build_translation(
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<TranslationConfig, ConfigError> {
    let raw_chain =
        lookup("TRANSLATOR_CHAIN").unwrap_or_else(|| DEFAULT_TRANSLATOR_CHAIN.to_string());
    let mut chain = Vec::new();
    for name in raw_chain.split(',').filter(|name| !name.trim().is_empty()) {
        let kind = TranslatorKind::parse(name)?;
        if !chain.contains(&kind) {
            chain.push(kind);
        }
    }
    Ok(TranslationConfig {
        chain,
        target_language: lookup("TARGET_LANGUAGE")
            .unwrap_or_else(|| DEFAULT_TARGET_LANGUAGE.to_string()),
        libre_url: lookup("LIBRETRANSLATE_URL")
            .unwrap_or_else(|| DEFAULT_LIBRETRANSLATE_URL.to_string()),
        libre_api_key: lookup("LIBRETRANSLATE_API_KEY").map(Secret::new),
    })
}

/// Folder paths always start with `/` and never end with one.
fn normalize_folder(folder: &str) -> String {
    let trimmed = folder.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return DEFAULT_DROPBOX_FOLDER.to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn positive<T>(value: Option<String>) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    value
        .and_then(|value| value.parse::<T>().ok())
        .filter(|value| *value > T::default())
}

/// Process environment lookup; blank values count as unset.
fn process_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

/// Reads a dotenv-style file. A missing file yields no values.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    Ok(parse_env(&content))
}

/// `KEY=value` lines with optional `export`. Quoted values may span several
/// lines, which is how a Netscape cookie jar fits in `CHANNEL_COOKIES`.
/// Double quotes understand `\n`, `\t` and backslash escapes; single quotes
/// are literal. Unquoted values end at ` #`.
fn parse_env(content: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    let mut lines = content.lines();
    while let Some(line) = lines.next() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let raw = raw.trim_start();
        let value = match raw.chars().next() {
            Some(quote @ ('"' | '\'')) => quoted_value(&raw[1..], quote, &mut lines),
            _ => raw.find(" #").map_or(raw, |at| &raw[..at]).trim().to_string(),
        };
        vars.insert(key.to_string(), value);
    }
    vars
}

/// Collects characters up to the closing `quote`, pulling further lines
/// while it is missing. An unterminated value keeps everything to the end.
fn quoted_value<'a>(
    first: &'a str,
    quote: char,
    rest: &mut impl Iterator<Item = &'a str>,
) -> String {
    let mut value = String::new();
    let mut current = first;
    loop {
        let mut chars = current.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' if quote == '"' => match chars.next() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some(other) => value.push(other),
                    None => value.push('\\'),
                },
                c if c == quote => return value,
                c => value.push(c),
            }
        }
        let Some(next) = rest.next() else {
            return value;
        };
        value.push('\n');
        current = next;
    }
}
