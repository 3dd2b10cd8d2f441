//! Display-title translation with an ordered fallback chain.

use crate::config::{Secret, TranslationConfig, TranslatorKind};
use crate::http::describe_ureq_error;
use crate::ledger::TranslationCache;
use crate::pacing::{Sleeper, jitter};
use serde::Deserialize;
use serde_json::{Value, json};
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const FALLBACK_TITLE_FILE: &str = "fallback_title.txt";
const GOOGLE_ENDPOINT: &str = "https://translate.googleapis.com/translate_a/single";
const MYMEMORY_ENDPOINT: &str = "https://api.mymemory.translated.net/get";
/// Pause after each failed strategy, in seconds.
pub const STRATEGY_DELAY: Range<f64> = 0.4..0.9;

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("{service} request failed: {message}")]
    Request {
        service: &'static str,
        message: String,
    },
    #[error("{service} returned an unexpected payload: {detail}")]
    Malformed {
        service: &'static str,
        detail: String,
    },
    #[error("{0} returned no text")]
    Empty(&'static str),
}

/// One way of turning a title into the target language.
pub trait TranslationStrategy {
    fn name(&self) -> &'static str;
    fn translate(&self, text: &str) -> Result<String, TranslateError>;
}

/// Result of resolving a display title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayTitle {
    pub text: String,
    /// True when the cache gained or changed an entry.
    pub cache_changed: bool,
}

pub struct TitleTranslator<'a> {
    strategies: Vec<Box<dyn TranslationStrategy>>,
    sleeper: &'a dyn Sleeper,
    fallback_file: Option<PathBuf>,
    delay: Range<f64>,
}

impl<'a> TitleTranslator<'a> {
    pub fn new(strategies: Vec<Box<dyn TranslationStrategy>>, sleeper: &'a dyn Sleeper) -> Self {
        Self {
            strategies,
            sleeper,
            fallback_file: None,
            delay: STRATEGY_DELAY,
        }
    }

    /// Static title used when every strategy fails.
    pub fn with_fallback_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.fallback_file = Some(path.into());
        self
    }

    /// Returns the cached title for `id` when one exists, otherwise walks the
    /// chain and records whatever it settles on.
    pub fn translate(&self, id: &str, raw_title: &str, cache: &mut TranslationCache) -> DisplayTitle {
        let raw_title = raw_title.trim();
        if raw_title.is_empty() {
            return DisplayTitle {
                text: id.to_string(),
                cache_changed: false,
            };
        }
        if let Some(cached) = cache.get(id).filter(|value| !value.trim().is_empty()) {
            debug!("Using cached title for {id}");
            return DisplayTitle {
                text: cached.clone(),
                cache_changed: false,
            };
        }

        let text = self
            .first_success(raw_title)
            .or_else(|| self.static_fallback(id))
            .unwrap_or_else(|| raw_title.to_string());
        let cache_changed = cache.get(id) != Some(&text);
        cache.insert(id.to_string(), text.clone());
        DisplayTitle { text, cache_changed }
    }

    fn first_success(&self, raw_title: &str) -> Option<String> {
        for strategy in &self.strategies {
            match strategy.translate(raw_title) {
                Ok(text) if !text.trim().is_empty() => {
                    let text = text.trim().to_string();
                    info!("Translated using {}: {}", strategy.name(), text);
                    return Some(text);
                }
                Ok(_) => warn!("Translator {} returned nothing", strategy.name()),
                Err(err) => warn!("Translator {} error (ignored): {}", strategy.name(), err),
            }
            self.sleeper.sleep(jitter(self.delay.clone()));
        }
        None
    }

    fn static_fallback(&self, id: &str) -> Option<String> {
        let path = self.fallback_file.as_deref()?;
        let text = read_fallback(path)?;
        info!("Using fallback title from {} for {}", path.display(), id);
        Some(text)
    }
}

fn read_fallback(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(raw) => Some(raw.trim().to_string()).filter(|text| !text.is_empty()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => {
            warn!("Could not read {}: {}", path.display(), err);
            None
        }
    }
}

/// Builds the configured chain in order.
pub fn build_chain(
    config: &TranslationConfig,
    agent: &ureq::Agent,
) -> Vec<Box<dyn TranslationStrategy>> {
    config
        .chain
        .iter()
        .map(|kind| -> Box<dyn TranslationStrategy> {
            match kind {
                TranslatorKind::Google => Box::new(GoogleTranslate {
                    agent: agent.clone(),
                    target: config.target_language.clone(),
                }),
                TranslatorKind::Libre => Box::new(LibreTranslate {
                    agent: agent.clone(),
                    endpoint: config.libre_url.clone(),
                    api_key: config.libre_api_key.clone(),
                    target: config.target_language.clone(),
                }),
                TranslatorKind::MyMemory => Box::new(MyMemory {
                    agent: agent.clone(),
                    target: config.target_language.clone(),
                }),
                TranslatorKind::Transliterate => Box::new(Transliterate),
            }
        })
        .collect()
}

fn request_error(service: &'static str) -> impl FnOnce(ureq::Error) -> TranslateError {
    move |err| TranslateError::Request {
        service,
        message: describe_ureq_error(err),
    }
}

fn malformed(service: &'static str, detail: impl ToString) -> TranslateError {
    TranslateError::Malformed {
        service,
        detail: detail.to_string(),
    }
}

/// Public `gtx` endpoint used by browser extensions.
pub struct GoogleTranslate {
    agent: ureq::Agent,
    target: String,
}

impl TranslationStrategy for GoogleTranslate {
    fn name(&self) -> &'static str {
        "google"
    }

    fn translate(&self, text: &str) -> Result<String, TranslateError> {
        let body: Value = self
            .agent
            .get(GOOGLE_ENDPOINT)
            .query("client", "gtx")
            .query("sl", "auto")
            .query("tl", &self.target)
            .query("dt", "t")
            .query("q", text)
            .call()
            .map_err(request_error(self.name()))?
            .into_json()
            .map_err(|err| malformed(self.name(), err))?;
        parse_google(&body)
    }
}

/// The response is `[[["translated", "source", ...], ...], ...]`; long
/// titles come back split into several segments.
fn parse_google(body: &Value) -> Result<String, TranslateError> {
    let segments = body
        .get(0)
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("google", "missing segment list"))?;
    let joined: String = segments
        .iter()
        .filter_map(|segment| segment.get(0).and_then(Value::as_str))
        .collect();
    non_empty("google", joined)
}

pub struct LibreTranslate {
    agent: ureq::Agent,
    endpoint: String,
    api_key: Option<Secret>,
    target: String,
}

#[derive(Deserialize)]
struct LibreResponse {
    #[serde(rename = "translatedText")]
    translated_text: Option<String>,
    error: Option<String>,
}

impl TranslationStrategy for LibreTranslate {
    fn name(&self) -> &'static str {
        "libre"
    }

    fn translate(&self, text: &str) -> Result<String, TranslateError> {
        let mut payload = json!({
            "q": text,
            "source": "auto",
            "target": self.target,
            "format": "text",
        });
        if let Some(key) = &self.api_key {
            payload["api_key"] = Value::String(key.expose().to_string());
        }
        let response: LibreResponse = self
            .agent
            .post(&self.endpoint)
            .send_json(payload)
            .map_err(request_error(self.name()))?
            .into_json()
            .map_err(|err| malformed(self.name(), err))?;
        if let Some(error) = response.error {
            return Err(malformed(self.name(), error));
        }
        non_empty(self.name(), response.translated_text.unwrap_or_default())
    }
}

pub struct MyMemory {
    agent: ureq::Agent,
    target: String,
}

impl TranslationStrategy for MyMemory {
    fn name(&self) -> &'static str {
        "mymemory"
    }

    fn translate(&self, text: &str) -> Result<String, TranslateError> {
        let langpair = format!("Autodetect|{}", self.target);
        let body: Value = self
            .agent
            .get(MYMEMORY_ENDPOINT)
            .query("q", text)
            .query("langpair", &langpair)
            .call()
            .map_err(request_error(self.name()))?
            .into_json()
            .map_err(|err| malformed(self.name(), err))?;
        parse_mymemory(&body)
    }
}

/// `responseStatus` arrives as a number or a string depending on the error.
fn parse_mymemory(body: &Value) -> Result<String, TranslateError> {
    let status = match body.get("responseStatus") {
        Some(Value::Number(number)) => number.as_u64(),
        Some(Value::String(text)) => text.parse().ok(),
        _ => None,
    };
    if status != Some(200) {
        return Err(malformed(
            "mymemory",
            format!("status {}", status.map_or("missing".to_string(), |s| s.to_string())),
        ));
    }
    let text = body
        .pointer("/responseData/translatedText")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if text.starts_with("MYMEMORY WARNING") {
        return Err(malformed("mymemory", "quota warning"));
    }
    non_empty("mymemory", text.to_string())
}

/// Offline ASCII transliteration. Never fails on non-empty input.
pub struct Transliterate;

impl TranslationStrategy for Transliterate {
    fn name(&self) -> &'static str {
        "transliterate"
    }

    fn translate(&self, text: &str) -> Result<String, TranslateError> {
        let ascii = deunicode::deunicode(text);
        let collapsed = ascii.split_whitespace().collect::<Vec<_>>().join(" ");
        non_empty(self.name(), collapsed)
    }
}

fn non_empty(service: &'static str, text: String) -> Result<String, TranslateError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        Err(TranslateError::Empty(service))
    } else {
        Ok(trimmed.to_string())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Strategy with a fixed answer that counts how often it was asked.
    pub struct CountingStrategy {
        pub answer: Option<String>,
        pub calls: Rc<Cell<usize>>,
    }

    impl CountingStrategy {
        pub fn boxed(answer: Option<&str>) -> (Box<dyn TranslationStrategy>, Rc<Cell<usize>>) {
            let calls = Rc::new(Cell::new(0));
            let strategy = CountingStrategy {
                answer: answer.map(str::to_string),
                calls: Rc::clone(&calls),
            };
            (Box::new(strategy), calls)
        }
    }

    impl TranslationStrategy for CountingStrategy {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn translate(&self, _text: &str) -> Result<String, TranslateError> {
            self.calls.set(self.calls.get() + 1);
            self.answer.clone().ok_or(TranslateError::Empty("counting"))
        }
    }
}
