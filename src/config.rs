#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

use crate::ytdlp::DEFAULT_YTDLP_BIN;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_DOWNLOAD_DIR: &str = "./downloads";
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSettings {
    pub host: String,
    pub port: u16,
    pub download_dir: PathBuf,
    pub ytdlp_bin: PathBuf,
    /// 0 disables the limit.
    pub max_concurrent_jobs: usize,
    pub default_cookies_file: Option<PathBuf>,
    /// Request-supplied `cookies_file` names must resolve inside this directory.
    /// Unset means requests cannot name cookie files at all.
    pub cookies_dir: Option<PathBuf>,
    /// Origin used when building proxied stream links, e.g. `https://api.example.com`.
    pub public_base_url: Option<String>,
    pub allow_root: bool,
}

/// Values supplied on the command line. They win over both the environment
/// and the `.env` file.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub download_dir: Option<PathBuf>,
    pub ytdlp_bin: Option<PathBuf>,
    pub max_concurrent_jobs: Option<usize>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_runtime_settings(&file_vars, env_var_string, overrides))
}

fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimeSettings {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("YTDLP_API_HOST"))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = overrides
        .port
        .or_else(|| lookup("PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_PORT);
    let download_dir = overrides
        .download_dir
        .or_else(|| lookup("DOWNLOAD_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOAD_DIR));
    let ytdlp_bin = overrides
        .ytdlp_bin
        .or_else(|| lookup("YTDLP_BIN").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_BIN));
    let max_concurrent_jobs = overrides
        .max_concurrent_jobs
        .or_else(|| lookup("MAX_CONCURRENT_JOBS").and_then(|value| value.parse::<usize>().ok()))
        .unwrap_or(DEFAULT_MAX_CONCURRENT_JOBS);
    let default_cookies_file = lookup("DEFAULT_COOKIES_FILE").map(PathBuf::from);
    let cookies_dir = lookup("COOKIES_DIR").map(PathBuf::from);
    let public_base_url =
        lookup("PUBLIC_BASE_URL").map(|value| value.trim_end_matches('/').to_string());
    let allow_root = lookup("ALLOW_ROOT").is_some_and(|value| parse_flag(&value));

    RuntimeSettings {
        host,
        port,
        download_dir,
        ytdlp_bin,
        max_concurrent_jobs,
        default_cookies_file,
        cookies_dir,
        public_base_url,
        allow_root,
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_var_string(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    Some(value.trim().to_string()).filter(|value| !value.is_empty())
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

/// Loads `KEY=value` pairs from the operator's `.env` file.
///
/// Lines may carry a leading `export`, values may be wrapped in single or
/// double quotes, and comments start with `#`. Lines without `=` are skipped.
/// The server runs fine without the file, so a missing one yields no pairs.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    Ok(content.lines().filter_map(parse_env_line).collect())
}

fn parse_env_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), unquote(value.trim()).to_string()))
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .iter()
        .find_map(|quote| value.strip_prefix(*quote)?.strip_suffix(*quote))
        .unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn settings_from(contents: &str) -> RuntimeSettings {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_settings(&vars, |_| None, RuntimeOverrides::default())
    }

    #[test]
    fn empty_config_uses_defaults() {
        let settings = settings_from("");
        assert_eq!(settings.host, DEFAULT_HOST);
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.download_dir, PathBuf::from(DEFAULT_DOWNLOAD_DIR));
        assert_eq!(settings.ytdlp_bin, PathBuf::from(DEFAULT_YTDLP_BIN));
        assert_eq!(settings.max_concurrent_jobs, DEFAULT_MAX_CONCURRENT_JOBS);
        assert!(settings.default_cookies_file.is_none());
        assert!(settings.cookies_dir.is_none());
        assert!(settings.public_base_url.is_none());
        assert!(!settings.allow_root);
    }

    #[test]
    fn reads_every_key_from_file() {
        let settings = settings_from(
            "YTDLP_API_HOST=\"127.0.0.1\"\nPORT=\"8080\"\nDOWNLOAD_DIR=\"/srv/media\"\n\
             YTDLP_BIN=\"/opt/yt-dlp\"\nMAX_CONCURRENT_JOBS=\"0\"\n\
             DEFAULT_COOKIES_FILE=\"/srv/cookies.txt\"\nCOOKIES_DIR=\"/srv/cookies\"\nPUBLIC_BASE_URL=\"https://api.example.test/\"\n\
             ALLOW_ROOT=\"true\"\n",
        );
        assert_eq!(settings.host, "127.0.0.1");
        assert_eq!(settings.port, 8080);
        assert_eq!(settings.download_dir, PathBuf::from("/srv/media"));
        assert_eq!(settings.ytdlp_bin, PathBuf::from("/opt/yt-dlp"));
        assert_eq!(settings.max_concurrent_jobs, 0);
        assert_eq!(
            settings.default_cookies_file,
            Some(PathBuf::from("/srv/cookies.txt"))
        );
        assert_eq!(settings.cookies_dir, Some(PathBuf::from("/srv/cookies")));
        assert_eq!(
            settings.public_base_url.as_deref(),
            Some("https://api.example.test")
        );
        assert!(settings.allow_root);
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let settings = settings_from("PORT=\"nope\"\nMAX_CONCURRENT_JOBS=\"-3\"\n");
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.max_concurrent_jobs, DEFAULT_MAX_CONCURRENT_JOBS);
    }

    #[test]
    fn env_beats_file_and_overrides_beat_env() {
        let mut vars = HashMap::new();
        vars.insert("PORT".to_string(), "7000".to_string());
        vars.insert("DOWNLOAD_DIR".to_string(), "/file".to_string());
        vars.insert("YTDLP_API_HOST".to_string(), "file-host".to_string());

        let settings = build_runtime_settings(
            &vars,
            |key| match key {
                "PORT" => Some("8000".to_string()),
                "DOWNLOAD_DIR" => Some("/env".to_string()),
                _ => None,
            },
            RuntimeOverrides {
                port: Some(9000),
                host: Some("   ".into()),
                ..RuntimeOverrides::default()
            },
        );

        assert_eq!(settings.port, 9000);
        assert_eq!(settings.download_dir, PathBuf::from("/env"));
        assert_eq!(settings.host, "file-host");
    }

    #[test]
    fn blank_values_are_ignored() {
        let settings = settings_from("DEFAULT_COOKIES_FILE=\"\"\nPUBLIC_BASE_URL=\"  \"\n");
        assert!(settings.default_cookies_file.is_none());
        assert!(settings.public_base_url.is_none());
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export DOWNLOAD_DIR="/media"
            YTDLP_BIN='/usr/local/bin/yt-dlp'
            YTDLP_API_HOST =  "0.0.0.0"
            PORT=9090
            MIXED="half'
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("DOWNLOAD_DIR").unwrap(), "/media");
        assert_eq!(vars.get("YTDLP_BIN").unwrap(), "/usr/local/bin/yt-dlp");
        assert_eq!(vars.get("YTDLP_API_HOST").unwrap(), "0.0.0.0");
        assert_eq!(vars.get("PORT").unwrap(), "9090");
        assert_eq!(vars.get("MIXED").unwrap(), "\"half'");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn resolve_reads_custom_env_path() {
        let cfg = make_config("DOWNLOAD_DIR=\"/from-custom-env\"\n");
        let settings = resolve_runtime_settings(RuntimeOverrides {
            env_path: Some(cfg.path().to_path_buf()),
            download_dir: Some(PathBuf::from("/cli")),
            ..RuntimeOverrides::default()
        })
        .unwrap();
        assert_eq!(settings.download_dir, PathBuf::from("/cli"));
    }

    #[test]
    fn parse_flag_accepts_common_spellings() {
        for value in ["1", "true", "YES", " on "] {
            assert!(parse_flag(value), "{value}");
        }
        for value in ["0", "false", "no", ""] {
            assert!(!parse_flag(value), "{value}");
        }
    }
}
