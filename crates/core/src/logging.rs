//! Log filter selection, the daily log file, and scrubbing of generation
//! service credentials from everything written to disk.
//!
//! Filter precedence is `--log-filter`, then `-v`/`-vv`, then `RUST_LOG`,
//! then [`DEFAULT_LOG_FILTER`]. The noisy HTTP and ffmpeg targets are only
//! quieted when the user did not pick a filter on the command line.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::Metadata;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriter;

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str =
    "hyper=warn,hyper_util=warn,reqwest=warn,h2=warn,ffmpeg_stderr=error";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const REDACTED: &str = "[redacted]";

const LOG_DIR_NAME: &str = "logs";
const LOG_FILE_PREFIX: &str = "krafity";
const LOG_FILE_SUFFIX: &str = "log";

/// ffmpeg's stderr is kept at debug in the file even when the console
/// hides it.
const FFMPEG_TARGET: &str = "ffmpeg_stderr";

const HF_TOKEN_PREFIX: &str = "hf_";
const HF_TOKEN_MIN_BODY_LEN: usize = 8;
const BEARER: &str = "bearer";

/// Filter strings for the console and file layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub console: String,
    pub file: String,
}

impl LogFilters {
    pub fn select(cli_filter: Option<&str>, verbose: u8, rust_log: Option<&str>) -> Self {
        Self::with_noise(DEFAULT_NOISE_FILTER, cli_filter, verbose, rust_log)
    }

    pub fn with_noise(
        noise: &str,
        cli_filter: Option<&str>,
        verbose: u8,
        rust_log: Option<&str>,
    ) -> Self {
        let explicit = match (cli_filter, verbose) {
            (Some(filter), _) => Some(filter.to_string()),
            (None, 0) => None,
            (None, 1) => Some("debug".to_string()),
            (None, _) => Some("trace".to_string()),
        };
        if let Some(filter) = explicit {
            return Self {
                console: filter.clone(),
                file: filter,
            };
        }

        let base = rust_log.unwrap_or(DEFAULT_LOG_FILTER);
        let noise = noise.trim();
        if noise.is_empty() {
            return Self {
                console: base.to_string(),
                file: base.to_string(),
            };
        }

        Self {
            console: format!("{noise},{base}"),
            file: format!("{},{base}", file_noise(noise)),
        }
    }
}

/// Rewrites the console noise directives for the file: ffmpeg output is
/// raised to debug, everything else is kept as is.
fn file_noise(noise: &str) -> String {
    let mut directives: Vec<String> = noise
        .split(',')
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
        .filter(|directive| directive.split('=').next().map(str::trim) != Some(FFMPEG_TARGET))
        .map(ToString::to_string)
        .collect();
    directives.push(format!("{FFMPEG_TARGET}=debug"));
    directives.join(",")
}

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(LOG_DIR_NAME)
}

/// Daily-rotated `krafity.*.log` files under `<data_dir>/logs`. A retention
/// of zero falls back to [`DEFAULT_LOG_RETENTION_FILES`].
pub fn open_log_file(data_dir: &Path, retention_files: usize) -> Result<RollingFileAppender> {
    let dir = log_dir(data_dir);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create log directory: {}", dir.display()))?;

    let retention = if retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        retention_files
    };
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(retention)
        .build(&dir)
        .with_context(|| format!("failed to open log file in {}", dir.display()))
}

/// Wraps a [`MakeWriter`] so every line is passed through [`scrub_secrets`].
#[derive(Debug)]
pub struct Scrubbed<M> {
    inner: M,
}

impl<M> Scrubbed<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<'a, M: MakeWriter<'a>> MakeWriter<'a> for Scrubbed<M> {
    type Writer = ScrubbingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        ScrubbingWriter::new(self.inner.make_writer())
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        ScrubbingWriter::new(self.inner.make_writer_for(meta))
    }
}

/// Holds bytes until a newline arrives so a token split across writes is
/// still seen whole.
#[derive(Debug)]
pub struct ScrubbingWriter<W: Write> {
    inner: W,
    line: Vec<u8>,
}

impl<W: Write> ScrubbingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            line: Vec::new(),
        }
    }

    fn emit(&mut self, end: usize) -> io::Result<()> {
        let chunk: Vec<u8> = self.line.drain(..end).collect();
        let scrubbed = scrub_secrets(&String::from_utf8_lossy(&chunk));
        self.inner.write_all(scrubbed.as_bytes())
    }
}

impl<W: Write> Write for ScrubbingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.line.extend_from_slice(buf);
        while let Some(newline) = self.line.iter().position(|&byte| byte == b'\n') {
            self.emit(newline + 1)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.line.is_empty() {
            self.emit(self.line.len())?;
        }
        self.inner.flush()
    }
}

impl<W: Write> Drop for ScrubbingWriter<W> {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Masks `Bearer <credential>` values and bare Hugging Face tokens.
pub fn scrub_secrets(text: &str) -> String {
    scrub_hf_tokens(&scrub_bearer_values(text))
}

fn scrub_bearer_values(text: &str) -> String {
    let lower = text.to_ascii_lowercase();
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;

    while let Some(offset) = lower[cursor..].find(BEARER) {
        let start = cursor + offset;
        let after = start + BEARER.len();
        let value_start = after
            + bytes[after..]
                .iter()
                .take_while(|byte| **byte == b' ' || **byte == b'\t')
                .count();
        let value_end = value_start
            + bytes[value_start..]
                .iter()
                .take_while(|byte| !ends_credential(**byte))
                .count();

        let standalone = start == 0 || !is_token_byte(bytes[start - 1]);
        if standalone && value_start > after && value_end > value_start {
            out.push_str(&text[cursor..value_start]);
            out.push_str(REDACTED);
            cursor = value_end;
        } else {
            out.push_str(&text[cursor..after]);
            cursor = after;
        }
    }

    out.push_str(&text[cursor..]);
    out
}

fn scrub_hf_tokens(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;

    while let Some(offset) = text[cursor..].find(HF_TOKEN_PREFIX) {
        let start = cursor + offset;
        let body_start = start + HF_TOKEN_PREFIX.len();
        let body_end = body_start
            + bytes[body_start..]
                .iter()
                .take_while(|byte| byte.is_ascii_alphanumeric())
                .count();

        out.push_str(&text[cursor..start]);
        let standalone = start == 0 || !is_token_byte(bytes[start - 1]);
        if standalone && body_end - body_start >= HF_TOKEN_MIN_BODY_LEN {
            out.push_str(REDACTED);
        } else {
            out.push_str(&text[start..body_end]);
        }
        cursor = body_end;
    }

    out.push_str(&text[cursor..]);
    out
}

fn ends_credential(byte: u8) -> bool {
    byte.is_ascii_whitespace() || matches!(byte, b'"' | b'\'' | b',' | b';' | b')' | b']' | b'}')
}

fn is_token_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-'
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    const NOISE: &str = "reqwest=warn,ffmpeg_stderr=error";

    #[test]
    fn test_explicit_filters_skip_noise() {
        let cli = LogFilters::with_noise(NOISE, Some("krafity_core=trace"), 2, Some("error"));
        assert_eq!(cli.console, "krafity_core=trace");
        assert_eq!(cli.file, "krafity_core=trace");

        assert_eq!(LogFilters::with_noise(NOISE, None, 1, Some("warn")).console, "debug");
        assert_eq!(LogFilters::with_noise(NOISE, None, 3, None).file, "trace");
    }

    #[test]
    fn test_implicit_filters_carry_noise() {
        let filters = LogFilters::with_noise(NOISE, None, 0, Some("krafity_core=debug"));
        assert_eq!(filters.console, "reqwest=warn,ffmpeg_stderr=error,krafity_core=debug");
        assert_eq!(filters.file, "reqwest=warn,ffmpeg_stderr=debug,krafity_core=debug");

        let defaults = LogFilters::select(None, 0, None);
        assert_eq!(defaults.console, format!("{DEFAULT_NOISE_FILTER},info"));
        assert!(defaults.file.ends_with("ffmpeg_stderr=debug,info"));
    }

    #[test]
    fn test_file_noise_adds_ffmpeg_when_missing() {
        let filters = LogFilters::with_noise("reqwest=error", None, 0, None);
        assert_eq!(filters.file, "reqwest=error,ffmpeg_stderr=debug,info");
        assert_eq!(LogFilters::with_noise("  ", None, 0, None).console, "info");
    }

    #[test]
    fn test_scrub_bearer_and_hf_tokens() {
        let line = "GET /config Authorization: Bearer hf_abcdefghijkl failed; \
                    KRAFITY_HF_TOKENS=hf_zyxwvutsrqpo,hf_qwertyuiopas";
        let scrubbed = scrub_secrets(line);

        assert!(!scrubbed.contains("hf_abcdefghijkl"));
        assert!(!scrubbed.contains("hf_zyxwvutsrqpo"));
        assert!(!scrubbed.contains("hf_qwertyuiopas"));
        assert!(scrubbed.contains(&format!("Authorization: Bearer {REDACTED} failed")));
        assert!(scrubbed.ends_with(&format!("={REDACTED},{REDACTED}")));
    }

    #[test]
    fn test_scrub_bearer_any_case_and_quoted() {
        assert_eq!(
            scrub_secrets(r#"header="BEARER abc.def-123""#),
            format!(r#"header="BEARER {REDACTED}""#)
        );
        assert_eq!(scrub_secrets("bearer\tsecret"), format!("bearer\t{REDACTED}"));
    }

    #[test]
    fn test_scrub_leaves_lookalikes_alone() {
        for line in [
            "path=/tmp/hf_cache",
            "shelf_abcdefghij",
            "forbearer token",
            "bearer",
            "unbearer abc",
        ] {
            assert_eq!(scrub_secrets(line), line);
        }
    }

    #[test]
    fn test_writer_scrubs_token_split_across_writes() {
        let mut sink = Vec::new();
        {
            let mut writer = ScrubbingWriter::new(&mut sink);
            writer.write_all(b"retrying with hf_abcd").expect("first write");
            writer.write_all(b"efghijkl now\npartial").expect("second write");
        }

        let output = String::from_utf8(sink).expect("utf8");
        assert_eq!(output, format!("retrying with {REDACTED} now\npartial"));
    }

    #[test]
    fn test_open_log_file_creates_log_dir() {
        let data_dir = tempdir().expect("tempdir");
        open_log_file(data_dir.path(), 0).expect("log file opens");
        assert!(log_dir(data_dir.path()).is_dir());
    }

    #[test]
    fn test_open_log_file_fails_when_data_dir_is_a_file() {
        let file = NamedTempFile::new().expect("temp file");
        let err = open_log_file(file.path(), 3).expect_err("cannot nest under a file");
        assert!(err.to_string().contains("failed to create log directory"));
    }
}
