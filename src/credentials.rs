//! Credential bundles forwarded to yt-dlp.
//!
//! Requests may name a browser profile to borrow cookies from, paste a
//! Netscape cookie file inline, or name a cookie file inside the operator's
//! cookie directory. Bad input never fails a request: it is logged and the
//! request continues without credentials.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

/// Browsers yt-dlp can read cookies from.
const SUPPORTED_BROWSERS: &[&str] = &[
    "brave", "chrome", "chromium", "edge", "firefox", "opera", "safari", "vivaldi", "whale",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialBundle {
    /// `--cookies-from-browser` value, e.g. `firefox` or `chrome:Profile 1`.
    Browser(String),
    /// Netscape cookie file contents.
    CookieText(String),
    CookieFile(PathBuf),
}

/// Raw credential fields as they appear in request bodies.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialFields {
    #[serde(default)]
    pub cookies_from_browser: Option<String>,
    #[serde(default)]
    pub cookies_text: Option<String>,
    #[serde(default)]
    pub cookies_file: Option<String>,
}

impl CredentialFields {
    /// Turns the request fields into at most one bundle. Anything ambiguous or
    /// unusable yields `None`.
    ///
    /// `cookies_file` is only honoured when it resolves to a file under
    /// `cookies_dir`; relative names are looked up inside that directory.
    pub fn resolve(&self, cookies_dir: Option<&Path>) -> Option<CredentialBundle> {
        let browser = non_blank(self.cookies_from_browser.as_deref());
        let text = non_blank(self.cookies_text.as_deref());
        let file = non_blank(self.cookies_file.as_deref());

        let supplied = [browser.is_some(), text.is_some(), file.is_some()]
            .into_iter()
            .filter(|present| *present)
            .count();
        if supplied > 1 {
            warn!("multiple credential sources supplied; continuing without credentials");
            return None;
        }

        if let Some(profile) = browser {
            return browser_bundle(profile);
        }
        if let Some(text) = text {
            return Some(CredentialBundle::CookieText(text.to_string()));
        }
        if let Some(name) = file {
            return confined_cookie_file(name, cookies_dir);
        }
        None
    }
}

fn confined_cookie_file(name: &str, cookies_dir: Option<&Path>) -> Option<CredentialBundle> {
    let Some(dir) = cookies_dir else {
        warn!("cookies_file requires COOKIES_DIR; continuing without credentials");
        return None;
    };
    let inside = dir
        .canonicalize()
        .and_then(|root| dir.join(name).canonicalize().map(|path| (root, path)));
    match inside {
        Ok((root, path)) if path.starts_with(&root) => cookie_file_bundle(path),
        Ok(_) => {
            warn!(name, "cookie file outside COOKIES_DIR; continuing without credentials");
            None
        }
        Err(_) => {
            warn!(name, "cookie file not found; continuing without credentials");
            None
        }
    }
}

/// Cookie file configured by the operator, applied when a request carries no
/// usable credentials of its own.
pub fn default_bundle(path: Option<PathBuf>) -> Option<CredentialBundle> {
    cookie_file_bundle(path?)
}

fn browser_bundle(profile: &str) -> Option<CredentialBundle> {
    // BROWSER[+KEYRING][:PROFILE][::CONTAINER]
    let name = profile
        .split(['+', ':'])
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    if SUPPORTED_BROWSERS.contains(&name.as_str()) {
        Some(CredentialBundle::Browser(profile.to_string()))
    } else {
        warn!(browser = %name, "unsupported cookie browser; continuing without credentials");
        None
    }
}

fn cookie_file_bundle(path: PathBuf) -> Option<CredentialBundle> {
    if path.is_file() {
        Some(CredentialBundle::CookieFile(path))
    } else {
        warn!(path = %path.display(), "cookie file not found; continuing without credentials");
        None
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
