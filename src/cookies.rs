//! Cookie persistence for Google Scholar scraping.
//!
//! Scholar serves far fewer block pages to a session that already carries
//! consent and preference cookies. Cookies are exported from a browser once and
//! replayed on every page request.

use crate::error::{BiblioError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const COOKIE_FILE: &str = ".rustbiblio_scholar_cookies.json";

/// Default cookie file path: `~/.rustbiblio_scholar_cookies.json`
fn default_cookie_path() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|p| p.join(COOKIE_FILE))
        .ok_or_else(|| BiblioError::Config("Cannot determine home directory".to_string()))
}

/// Cookie entry in the browser-export format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default, alias = "http_only")]
    pub http_only: bool,
    #[serde(default, alias = "expirationDate")]
    pub expires: Option<f64>,
}

pub struct CookieManager {
    path: PathBuf,
}

impl CookieManager {
    pub fn new() -> Result<Self> {
        Ok(Self {
            path: default_cookie_path()?,
        })
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load cookies from file.
    ///
    /// A missing or unreadable file yields no cookies.
    pub fn load(&self) -> Vec<Cookie> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "Cookie file not found");
            return Vec::new();
        }

        match std::fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str::<Vec<Cookie>>(&content) {
                Ok(cookies) => {
                    info!(count = cookies.len(), path = %self.path.display(), "Loaded cookies");
                    cookies
                }
                Err(e) => {
                    warn!(error = %e, "Failed to parse cookies");
                    Vec::new()
                }
            },
            Err(e) => {
                warn!(error = %e, "Failed to read cookie file");
                Vec::new()
            }
        }
    }

    /// `Cookie` header value for Google domains, empty when none are stored.
    pub fn cookie_header(&self) -> String {
        build_cookie_header(&self.load())
    }

    pub fn save(&self, cookies: &[Cookie]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(cookies)?;
        std::fs::write(&self.path, content)?;
        info!(count = cookies.len(), path = %self.path.display(), "Saved cookies");
        Ok(())
    }

    /// Parse a pasted browser export and store it. Returns the cookie count.
    pub fn import_json(&self, json: &str) -> Result<usize> {
        let cookies: Vec<Cookie> = serde_json::from_str(json.trim())
            .map_err(|e| BiblioError::Validation(format!("Invalid cookie JSON: {}", e)))?;
        self.save(&cookies)?;
        Ok(cookies.len())
    }

    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
            info!(path = %self.path.display(), "Cleared cookies");
        }
        Ok(())
    }
}

impl Default for CookieManager {
    fn default() -> Self {
        Self::new().unwrap_or_else(|_| Self {
            path: PathBuf::from(COOKIE_FILE),
        })
    }
}

fn build_cookie_header(cookies: &[Cookie]) -> String {
    cookies
        .iter()
        .filter(|c| c.domain.contains("google"))
        .map(|c| format!("{}={}", c.name, c.value))
        .collect::<Vec<_>>()
        .join("; ")
}
