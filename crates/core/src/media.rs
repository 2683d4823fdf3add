//! Frame extraction and thumbnail placement.
//!
//! Completed clips are decoded out of process with `ffmpeg`; the resulting
//! PNG is sized with the `image` crate and placed inside a destination
//! frame by [`fit_within`].

use std::env;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;
use url::Url;

use crate::types::ImagePlacement;

const FFMPEG_BINARY: &str = "ffmpeg";

/// Which end of a clip to sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePosition {
    First,
    Last,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFrame {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl ExtractedFrame {
    pub fn from_png(png: Vec<u8>) -> Result<Self> {
        let (width, height) = image_dimensions(&png)?;
        Ok(Self { png, width, height })
    }
}

#[async_trait]
pub trait FrameExtractor: Send + Sync {
    async fn extract(&self, media_url: &str, position: FramePosition) -> Result<ExtractedFrame>;
}

/// Scaled, centered rectangle of a source image inside a destination box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub scale: f64,
}

impl Placement {
    pub fn into_image(self, src: impl Into<String>) -> ImagePlacement {
        ImagePlacement {
            src: src.into(),
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
        }
    }
}

/// Aspect-preserving fit: `scale = min(dw/sw, dh/sh)`, centered with
/// `offset = (dest - src * scale) / 2`. Degenerate sizes yield `None`.
pub fn fit_within(
    src_width: f64,
    src_height: f64,
    dest_width: f64,
    dest_height: f64,
) -> Option<Placement> {
    let sizes = [src_width, src_height, dest_width, dest_height];
    if sizes.iter().any(|side| !side.is_finite() || *side <= 0.0) {
        return None;
    }

    let scale = (dest_width / src_width).min(dest_height / src_height);
    let width = src_width * scale;
    let height = src_height * scale;
    Some(Placement {
        x: (dest_width - width) / 2.0,
        y: (dest_height - height) / 2.0,
        width,
        height,
        scale,
    })
}

pub fn image_dimensions(bytes: &[u8]) -> Result<(u32, u32)> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .context("failed to sniff image format")?
        .into_dimensions()
        .context("failed to decode image dimensions")
}

/// Runs a locally installed `ffmpeg` and reads one PNG frame from stdout.
#[derive(Debug, Clone)]
pub struct FfmpegFrameExtractor {
    binary: PathBuf,
}

impl FfmpegFrameExtractor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Prefers an `ffmpeg` shipped next to the executable or in `./bin`,
    /// falling back to whatever `PATH` resolves.
    pub fn locate() -> Self {
        let binary = find_binary_in_dirs(FFMPEG_BINARY, &candidate_bin_dirs())
            .unwrap_or_else(|| PathBuf::from(FFMPEG_BINARY));
        Self { binary }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

#[async_trait]
impl FrameExtractor for FfmpegFrameExtractor {
    async fn extract(&self, media_url: &str, position: FramePosition) -> Result<ExtractedFrame> {
        let input = ffmpeg_input(media_url)?;
        let args = build_ffmpeg_args(&input, position);
        debug!(
            cmd = %format!("{} {}", self.binary.display(), args.join(" ")),
            "Extracting frame"
        );

        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .context("failed to launch ffmpeg -- is it installed?")?;

        for line in String::from_utf8_lossy(&output.stderr).lines() {
            debug!(target: "ffmpeg_stderr", "{}", line);
        }

        if !output.status.success() {
            bail!("ffmpeg exited with status {}", output.status);
        }
        if output.stdout.is_empty() {
            bail!("ffmpeg produced no frame for {media_url}");
        }

        ExtractedFrame::from_png(output.stdout)
    }
}

fn ffmpeg_input(media_url: &str) -> Result<String> {
    let parsed = Url::parse(media_url).with_context(|| format!("invalid media URL: {media_url}"))?;
    match parsed.scheme() {
        "file" => parsed
            .to_file_path()
            .map(|path| path.to_string_lossy().into_owned())
            .map_err(|_| anyhow!("media URL is not a local path: {media_url}")),
        "http" | "https" => Ok(media_url.to_string()),
        other => bail!("unsupported media URL scheme: {other}"),
    }
}

pub fn build_ffmpeg_args(input: &str, position: FramePosition) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];
    if position == FramePosition::Last {
        args.extend(["-sseof".into(), "-0.1".into()]);
    }
    args.extend([
        "-i".into(),
        input.to_string(),
        "-frames:v".into(),
        "1".into(),
        "-f".into(),
        "image2pipe".into(),
        "-vcodec".into(),
        "png".into(),
        "pipe:1".into(),
    ]);
    args
}

fn candidate_bin_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            dirs.push(exe_dir.to_path_buf());
            dirs.push(exe_dir.join("bin"));
        }
    }

    if let Ok(cwd) = env::current_dir() {
        let cwd_bin = cwd.join("bin");
        if !dirs.contains(&cwd_bin) {
            dirs.push(cwd_bin);
        }
    }

    dirs
}

fn find_binary_in_dirs(binary: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    let name = if cfg!(windows) {
        format!("{binary}.exe")
    } else {
        binary.to_string()
    };

    dirs.iter()
        .map(|dir| dir.join(&name))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tiny_png(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        image::RgbImage::new(width, height)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .expect("encode png");
        bytes
    }

    #[test]
    fn test_fit_within_letterboxes_wide_source() {
        let placement = fit_within(1920.0, 1080.0, 640.0, 480.0).expect("valid sizes");
        assert!((placement.scale - 1.0 / 3.0).abs() < 1e-9);
        assert!((placement.width - 640.0).abs() < 1e-9);
        assert!((placement.height - 360.0).abs() < 1e-9);
        assert!(placement.x.abs() < 1e-9);
        assert!((placement.y - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_fit_within_pillarboxes_tall_source() {
        let placement = fit_within(720.0, 1280.0, 640.0, 360.0).expect("valid sizes");
        assert!((placement.height - 360.0).abs() < 1e-9);
        assert!((placement.width - 202.5).abs() < 1e-9);
        assert!((placement.x - 218.75).abs() < 1e-9);
        assert!(placement.y.abs() < 1e-9);
    }

    #[test]
    fn test_fit_within_rejects_degenerate_sizes() {
        assert!(fit_within(0.0, 10.0, 10.0, 10.0).is_none());
        assert!(fit_within(10.0, 10.0, -1.0, 10.0).is_none());
        assert!(fit_within(f64::NAN, 10.0, 10.0, 10.0).is_none());
    }

    #[test]
    fn test_extracted_frame_reads_png_dimensions() {
        let frame = ExtractedFrame::from_png(tiny_png(12, 8)).expect("png decodes");
        assert_eq!((frame.width, frame.height), (12, 8));

        let err = ExtractedFrame::from_png(b"not an image".to_vec()).expect_err("garbage fails");
        assert!(!err.to_string().is_empty());
    }

    #[test]
    fn test_ffmpeg_args_for_last_frame_seek_from_end() {
        let first = build_ffmpeg_args("/tmp/a.mp4", FramePosition::First);
        assert!(!first.contains(&"-sseof".to_string()));

        let last = build_ffmpeg_args("/tmp/a.mp4", FramePosition::Last);
        let sseof = last.iter().position(|arg| arg == "-sseof").expect("sseof");
        let input = last.iter().position(|arg| arg == "-i").expect("input");
        assert!(sseof < input, "seek must precede the input");
        assert_eq!(last.last().map(String::as_str), Some("pipe:1"));
    }

    #[test]
    fn test_ffmpeg_input_resolves_file_urls() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("clip.mp4");
        let url = Url::from_file_path(&path).expect("file url");

        let input = ffmpeg_input(url.as_str()).expect("file url resolves");
        assert_eq!(PathBuf::from(input), path);
        assert_eq!(
            ffmpeg_input("https://x/clip.mp4").expect("https passes"),
            "https://x/clip.mp4"
        );
        assert!(ffmpeg_input("ftp://x/clip.mp4").is_err());
    }

    #[test]
    fn test_find_binary_in_dirs_prefers_first_match() {
        let first = tempdir().expect("tempdir");
        let second = tempdir().expect("tempdir");
        let name = if cfg!(windows) { "ffmpeg.exe" } else { "ffmpeg" };
        std::fs::write(second.path().join(name), b"").expect("write fake binary");

        let dirs = vec![first.path().to_path_buf(), second.path().to_path_buf()];
        assert_eq!(
            find_binary_in_dirs("ffmpeg", &dirs),
            Some(second.path().join(name))
        );
        assert_eq!(find_binary_in_dirs("ffprobe", &dirs), None);
    }
}
