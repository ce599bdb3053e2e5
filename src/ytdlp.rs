//! [`ExtractionProvider`] backed by the `yt-dlp` executable.
//!
//! Metadata comes from `--dump-single-json`. Transfers ask yt-dlp to print
//! machine readable progress (`--progress-template ... %(progress)j`) and the
//! final file path (`--print after_move:...`) behind fixed markers, so stdout
//! can be parsed line by line while the download runs.

use std::{
    collections::BTreeMap,
    fmt::Display,
    fs,
    io::{BufRead, BufReader, Read},
    path::PathBuf,
    process::{Command, Stdio},
    thread,
};

use serde::Deserialize;
use tempfile::NamedTempFile;
use tracing::{debug, trace, warn};

use crate::credentials::CredentialBundle;
use crate::provider::{
    ExtractOptions, ExtractionProvider, MediaMetadata, ProviderError, TransferRequest,
};
use crate::registry::{JobKind, TransferProgress};
use crate::rendition::{Rendition, UNKNOWN_CODEC};
use crate::security::write_cookie_jar;

pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";

const PROGRESS_MARKER: &str = "[ytdlp-api:progress]";
const OUTPUT_MARKER: &str = "[ytdlp-api:output]";
const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";
const AUDIO_FORMAT: &str = "bestaudio/best";
const AUDIO_CODEC: &str = "mp3";
const AUDIO_QUALITY: &str = "192K";

#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: PathBuf,
}

impl YtDlp {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn launch_error(&self, source: std::io::Error) -> ProviderError {
        ProviderError::Launch {
            program: self.binary.display().to_string(),
            source,
        }
    }
}

impl ExtractionProvider for YtDlp {
    fn extract(&self, url: &str, options: &ExtractOptions) -> Result<MediaMetadata, ProviderError> {
        let cookies = CookieArgs::for_bundle(options.credentials.as_ref());
        let mut command = Command::new(&self.binary);
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg("--no-playlist");
        if let Some(format) = &options.format {
            command.arg("--format").arg(format);
        }
        command.args(&cookies.args).arg("--").arg(url);

        debug!(url, "resolving metadata");
        let output = command.output().map_err(|err| self.launch_error(err))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProviderError::Extraction(summarize_failure(
                &stderr,
                output.status,
            )));
        }

        let info: RawInfo = serde_json::from_slice(&output.stdout)?;
        Ok(info.into_metadata())
    }

    fn transfer(
        &self,
        job_id: &str,
        request: &TransferRequest,
        on_progress: &mut dyn FnMut(&str, TransferProgress),
    ) -> Result<PathBuf, ProviderError> {
        fs::create_dir_all(&request.output_dir)?;
        let cookies = CookieArgs::for_bundle(request.credentials.as_ref());

        let mut command = Command::new(&self.binary);
        command
            .args(transfer_args(request))
            .args(&cookies.args)
            .arg("--")
            .arg(&request.url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(job_id, url = %request.url, "starting transfer");
        let mut child = command.spawn().map_err(|err| self.launch_error(err))?;

        // Drain stderr on its own thread so a chatty extractor cannot block on
        // a full pipe while stdout is being consumed.
        let stderr = child.stderr.take();
        let stderr_reader = thread::spawn(move || {
            let mut raw = Vec::new();
            if let Some(mut pipe) = stderr {
                let _ = pipe.read_to_end(&mut raw);
            }
            String::from_utf8_lossy(&raw).into_owned()
        });

        let mut location = None;
        if let Some(stdout) = child.stdout.take() {
            // Titles are not guaranteed to be UTF-8, so lines are read as bytes
            // and decoded lossily.
            let mut reader = BufReader::new(stdout);
            let mut raw = Vec::new();
            loop {
                raw.clear();
                match reader.read_until(b'\n', &mut raw) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(job_id, error = %err, "stopped reading yt-dlp output");
                        break;
                    }
                }
                let line = String::from_utf8_lossy(&raw);
                match parse_stdout_line(&line) {
                    Some(StdoutEvent::Progress(progress)) => on_progress(job_id, progress),
                    Some(StdoutEvent::Output(path)) => location = Some(path),
                    None => trace!(job_id, line = %line.trim_end(), "yt-dlp"),
                }
            }
        }

        let status = child.wait()?;
        let stderr = stderr_reader.join().unwrap_or_default();
        if !status.success() {
            return Err(ProviderError::Extraction(summarize_failure(&stderr, status)));
        }
        location.ok_or(ProviderError::MissingOutput)
    }
}

/// Keeps a staged cookie jar alive for as long as the arguments referencing it.
struct CookieArgs {
    args: Vec<String>,
    _jar: Option<NamedTempFile>,
}

impl CookieArgs {
    fn none() -> Self {
        Self {
            args: Vec::new(),
            _jar: None,
        }
    }

    /// File and text bundles are staged into a private copy because yt-dlp
    /// writes the jar back when it exits.
    fn for_bundle(bundle: Option<&CredentialBundle>) -> Self {
        let staged = match bundle {
            None => return Self::none(),
            Some(CredentialBundle::Browser(profile)) => {
                return Self {
                    args: vec!["--cookies-from-browser".into(), profile.clone()],
                    _jar: None,
                };
            }
            Some(CredentialBundle::CookieFile(path)) => fs::read(path)
                .and_then(|raw| write_cookie_jar(&String::from_utf8_lossy(&raw))),
            Some(CredentialBundle::CookieText(text)) => write_cookie_jar(text),
        };
        match staged {
            Ok(jar) => Self {
                args: vec![
                    "--cookies".into(),
                    jar.path().to_string_lossy().into_owned(),
                ],
                _jar: Some(jar),
            },
            Err(err) => {
                warn!(error = %err, "could not stage cookies; continuing without credentials");
                Self::none()
            }
        }
    }
}

fn transfer_args(request: &TransferRequest) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--newline".into(),
        "--progress".into(),
        "--no-warnings".into(),
        "--no-playlist".into(),
        "--progress-template".into(),
        format!("download:{PROGRESS_MARKER} %(progress)j"),
        "--print".into(),
        format!("after_move:{OUTPUT_MARKER} %(filepath)s"),
        "--output".into(),
        request
            .output_dir
            .join(OUTPUT_TEMPLATE)
            .to_string_lossy()
            .into_owned(),
    ];
    match request.kind {
        JobKind::AudioOnly => args.extend(
            [
                "--format",
                AUDIO_FORMAT,
                "--extract-audio",
                "--audio-format",
                AUDIO_CODEC,
                "--audio-quality",
                AUDIO_QUALITY,
            ]
            .map(String::from),
        ),
        JobKind::Video => {
            if let Some(format) = &request.format {
                args.push("--format".into());
                args.push(format.clone());
            }
        }
    }
    args
}

#[derive(Debug, PartialEq)]
enum StdoutEvent {
    Progress(TransferProgress),
    Output(PathBuf),
}

fn parse_stdout_line(line: &str) -> Option<StdoutEvent> {
    let line = line.trim_end_matches(['\r', '\n']);
    if let Some(payload) = line.strip_prefix(PROGRESS_MARKER) {
        return serde_json::from_str::<RawProgress>(payload.trim())
            .ok()
            .map(|raw| StdoutEvent::Progress(raw.into()));
    }
    let rest = line.strip_prefix(OUTPUT_MARKER)?;
    let path = rest.strip_prefix(' ').unwrap_or(rest);
    if path.is_empty() {
        return None;
    }
    Some(StdoutEvent::Output(PathBuf::from(path)))
}

/// Picks the most useful line out of yt-dlp's stderr for the caller.
fn summarize_failure(stderr: &str, status: impl Display) -> String {
    let lines = || stderr.lines().map(str::trim).filter(|line| !line.is_empty());
    lines()
        .filter(|line| line.starts_with("ERROR:"))
        .last()
        .or_else(|| lines().last())
        .map(str::to_string)
        .unwrap_or_else(|| format!("yt-dlp exited with {status}"))
}

fn to_count(value: Option<f64>) -> Option<u64> {
    value
        .filter(|value| value.is_finite() && *value >= 0.0)
        .map(|value| value as u64)
}

fn to_dimension(value: Option<f64>) -> Option<u32> {
    to_count(value).and_then(|value| u32::try_from(value).ok())
}

/// `"none"` means the stream is absent; a missing field only means yt-dlp
/// could not tell which codec is used.
fn normalize_codec(value: Option<String>) -> Option<String> {
    match value {
        None => Some(UNKNOWN_CODEC.to_string()),
        Some(codec) if codec.is_empty() || codec == "none" => None,
        Some(codec) => Some(codec),
    }
}

/// Subset of the progress hook dictionary yt-dlp renders with `%(progress)j`.
#[derive(Debug, Deserialize)]
struct RawProgress {
    downloaded_bytes: Option<f64>,
    total_bytes: Option<f64>,
    total_bytes_estimate: Option<f64>,
    speed: Option<f64>,
    eta: Option<f64>,
}

impl From<RawProgress> for TransferProgress {
    fn from(raw: RawProgress) -> Self {
        Self {
            downloaded_bytes: to_count(raw.downloaded_bytes),
            total_bytes: to_count(raw.total_bytes.or(raw.total_bytes_estimate)),
            speed: raw.speed.filter(|speed| speed.is_finite()),
            eta: to_count(raw.eta),
        }
    }
}

/// The parts of `--dump-single-json` the API reports. Numbers are read as
/// floats because extractors are inconsistent about integer fields.
#[derive(Debug, Deserialize)]
struct RawInfo {
    title: Option<String>,
    duration: Option<f64>,
    uploader: Option<String>,
    upload_date: Option<String>,
    view_count: Option<f64>,
    description: Option<String>,
    thumbnail: Option<String>,
    #[serde(default)]
    formats: Option<Vec<RawFormat>>,
}

#[derive(Debug, Deserialize)]
struct RawFormat {
    format_id: Option<String>,
    ext: Option<String>,
    acodec: Option<String>,
    vcodec: Option<String>,
    abr: Option<f64>,
    tbr: Option<f64>,
    width: Option<f64>,
    height: Option<f64>,
    fps: Option<f64>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
    resolution: Option<String>,
    format_note: Option<String>,
    url: Option<String>,
    #[serde(default)]
    http_headers: Option<BTreeMap<String, String>>,
}

impl RawInfo {
    fn into_metadata(self) -> MediaMetadata {
        let renditions = self
            .formats
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(index, format)| format.into_rendition(index))
            .collect();
        MediaMetadata {
            title: self.title,
            duration: self.duration,
            uploader: self.uploader,
            upload_date: self.upload_date,
            view_count: to_count(self.view_count),
            description: self.description,
            thumbnail: self.thumbnail,
            renditions,
        }
    }
}

impl RawFormat {
    fn into_rendition(self, index: usize) -> Rendition {
        Rendition {
            format_id: self.format_id.unwrap_or_else(|| index.to_string()),
            ext: self.ext,
            acodec: normalize_codec(self.acodec),
            vcodec: normalize_codec(self.vcodec),
            abr: self.abr,
            tbr: self.tbr,
            width: to_dimension(self.width),
            height: to_dimension(self.height),
            fps: self.fps,
            filesize: to_count(self.filesize.or(self.filesize_approx)),
            resolution: self.resolution,
            format_note: self.format_note,
            url: self.url,
            http_headers: self.http_headers.unwrap_or_default(),
        }
    }
}
