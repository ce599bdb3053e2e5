#![forbid(unsafe_code)]

//! Privilege and secret handling for the API server.

use std::io::{self, Write};

use anyhow::{Result, bail};
use nix::unistd::Uid;
use tempfile::NamedTempFile;
use tracing::warn;

const NETSCAPE_HEADER: &str = "# Netscape HTTP Cookie File";

/// Refuses to start as root unless the operator explicitly allowed it, which
/// container platforms usually require.
pub fn ensure_not_root(process: &str, allow_root: bool) -> Result<()> {
    check_uid(Uid::effective(), process, allow_root)
}

fn check_uid(uid: Uid, process: &str, allow_root: bool) -> Result<()> {
    if !uid.is_root() {
        return Ok(());
    }
    if allow_root {
        warn!(process, "running as root because ALLOW_ROOT is set");
        return Ok(());
    }
    bail!("{process} refuses to run as root; set ALLOW_ROOT=1 to override inside containers")
}

/// Writes inline cookie text to an owner-only temporary file that yt-dlp can
/// read. The file is removed when the returned handle drops.
///
/// yt-dlp rejects cookie files without the Netscape header, so one is added
/// when the caller pasted bare cookie lines.
pub fn write_cookie_jar(text: &str) -> io::Result<NamedTempFile> {
    let mut jar = tempfile::Builder::new()
        .prefix("ytdlp-cookies-")
        .suffix(".txt")
        .tempfile()?;
    let trimmed = text.trim_start();
    if !(trimmed.starts_with(NETSCAPE_HEADER) || trimmed.starts_with("# HTTP Cookie File")) {
        writeln!(jar, "{NETSCAPE_HEADER}")?;
    }
    jar.write_all(trimmed.as_bytes())?;
    if !trimmed.ends_with('\n') {
        writeln!(jar)?;
    }
    jar.flush()?;
    Ok(jar)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn unprivileged_uid_passes() {
        assert!(check_uid(Uid::from_raw(1000), "tester", false).is_ok());
    }

    #[test]
    fn root_uid_is_rejected_without_override() {
        let err = check_uid(Uid::from_raw(0), "tester", false).unwrap_err();
        assert!(err.to_string().contains("refuses to run as root"));
    }

    #[test]
    fn root_uid_passes_with_override() {
        assert!(check_uid(Uid::from_raw(0), "tester", true).is_ok());
    }

    #[test]
    fn cookie_jar_gains_netscape_header() {
        let jar = write_cookie_jar(".youtube.com\tTRUE\t/\tTRUE\t0\tYSC\tabc").unwrap();
        let contents = fs::read_to_string(jar.path()).unwrap();
        assert!(contents.starts_with(NETSCAPE_HEADER));
        assert!(contents.ends_with("YSC\tabc\n"));
    }

    #[test]
    fn cookie_jar_keeps_existing_header() {
        let text = "# Netscape HTTP Cookie File\n.example.test\tTRUE\t/\tFALSE\t0\tSID\tx\n";
        let jar = write_cookie_jar(text).unwrap();
        let contents = fs::read_to_string(jar.path()).unwrap();
        assert_eq!(contents, text);
    }

    #[cfg(unix)]
    #[test]
    fn cookie_jar_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let jar = write_cookie_jar("cookie").unwrap();
        let mode = fs::metadata(jar.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0);
    }

    #[test]
    fn cookie_jar_is_removed_on_drop() {
        let jar = write_cookie_jar("cookie").unwrap();
        let path = jar.path().to_path_buf();
        drop(jar);
        assert!(!path.exists());
    }
}
