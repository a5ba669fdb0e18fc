//! Invokes the external `gifsicle` binary to probe and compress GIFs.
//!
//! The tool is treated as a black box: we build a deterministic argument
//! list, spawn it, and parse its textual `--info` output with a couple of
//! regexes. None of this assumes anything about the tool beyond its CLI
//! surface and stdout format.

use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::models::{CompressionOptions, DropFrames, GifInfo};

static SCREEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"logical screen (\d+)x(\d+)").expect("valid regex"));
static IMAGES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+) images?").expect("valid regex"));

#[derive(Clone)]
pub struct CompressionExecutor {
    gifsicle_path: String,
}

pub struct CompressionOutcome {
    pub compressed_path: String,
    pub compressed_size: i64,
    pub compressed_width: i32,
    pub compressed_height: i32,
}

impl CompressionExecutor {
    pub fn new(gifsicle_path: impl Into<String>) -> Self {
        Self { gifsicle_path: gifsicle_path.into() }
    }

    /// Probes a GIF for its logical screen size and frame count. Falls back
    /// to `(0, 0, 1, size)` when the tool's output can't be parsed so callers
    /// degrade gracefully instead of failing the whole job.
    pub async fn probe(&self, path: &str) -> GifInfo {
        let size_bytes = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);

        let output = Command::new(&self.gifsicle_path)
            .arg("--info")
            .arg(path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        let Ok(output) = output else {
            warn!(path, "failed to spawn gifsicle for probing");
            return GifInfo { width: 0, height: 0, frames: 1, size_bytes };
        };

        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );

        let dims = SCREEN_RE.captures(&text).and_then(|c| {
            let w = c.get(1)?.as_str().parse().ok()?;
            let h = c.get(2)?.as_str().parse().ok()?;
            Some((w, h))
        });
        let frames = IMAGES_RE
            .captures(&text)
            .and_then(|c| c.get(1)?.as_str().parse::<u32>().ok())
            .unwrap_or(1);

        match dims {
            Some((width, height)) => GifInfo { width, height, frames, size_bytes },
            None => {
                debug!(path, "could not parse gifsicle --info output");
                GifInfo { width: 0, height: 0, frames: 1, size_bytes }
            }
        }
    }

    /// Runs the compression tool on `input_path`, writing to `output_path`,
    /// then re-probes the result for its final size and dimensions.
    pub async fn compress(
        &self,
        input_path: &str,
        output_path: &str,
        options: &CompressionOptions,
        info: &GifInfo,
    ) -> Result<CompressionOutcome> {
        let args = build_args(input_path, output_path, options, info);

        let output = Command::new(&self.gifsicle_path)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(AppError::Io)?;

        if !output.status.success() {
            return Err(AppError::ToolFailed {
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                code: output.status.code(),
            });
        }

        let compressed_size = tokio::fs::metadata(output_path)
            .await
            .map(|m| m.len() as i64)
            .map_err(|_| AppError::OutputMissing)?;

        let compressed_info = self.probe(output_path).await;

        Ok(CompressionOutcome {
            compressed_path: output_path.to_string(),
            compressed_size,
            compressed_width: compressed_info.width as i32,
            compressed_height: compressed_info.height as i32,
        })
    }
}

/// The best-fit scale for a resize request, or `None` when no resize applies.
/// Never upscales; returns `1.0` (a no-op) when the target is not smaller.
fn resize_dimensions(options: &CompressionOptions, info: &GifInfo) -> Option<(u32, u32)> {
    if !options.resize_enabled || info.width == 0 || info.height == 0 {
        return None;
    }
    let (w_o, h_o) = (info.width as f64, info.height as f64);

    match (options.target_width, options.target_height) {
        (Some(w_t), Some(h_t)) => {
            let scale = (w_t as f64 / w_o).min(h_t as f64 / h_o).min(1.0);
            if scale >= 1.0 {
                None
            } else {
                Some(((w_o * scale).round() as u32, (h_o * scale).round() as u32))
            }
        }
        (Some(w_t), None) => {
            if (w_t as f64) < w_o {
                Some((w_t, (h_o * w_t as f64 / w_o).round() as u32))
            } else {
                None
            }
        }
        (None, Some(h_t)) => {
            if (h_t as f64) < h_o {
                Some(((w_o * h_t as f64 / h_o).round() as u32, h_t))
            } else {
                None
            }
        }
        (None, None) => None,
    }
}

/// Zero-indexed frame selectors for "keep every Nth frame starting at N":
/// indices `{n-1, 2n-1, 3n-1, ...}` up to `frame_count`.
fn frame_selectors(drop_frames: DropFrames, frame_count: u32) -> Vec<u32> {
    let Some(n) = drop_frames.stride() else { return Vec::new() };
    if n == 0 || frame_count == 0 {
        return Vec::new();
    }
    let mut indices = Vec::new();
    let mut k = n;
    while k <= frame_count {
        indices.push(k - 1);
        k += n;
    }
    indices
}

fn build_args(input_path: &str, output_path: &str, options: &CompressionOptions, info: &GifInfo) -> Vec<String> {
    let mut args = Vec::new();

    args.push(format!("--lossy={}", options.compression_level));
    args.push("-O3".to_string());
    if options.undo_optimizations {
        args.push("--unoptimize".to_string());
    }
    if options.reduce_colors && options.number_of_colors < 256 {
        args.push(format!("--colors={}", options.number_of_colors));
    }

    if let Some((w, h)) = resize_dimensions(options, info) {
        args.push("--resize".to_string());
        args.push(format!("{w}x{h}"));
    }

    args.push(input_path.to_string());

    for index in frame_selectors(options.drop_frames, info.frames) {
        args.push(format!("#{index}"));
    }

    args.push("--output".to_string());
    args.push(output_path.to_string());

    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(w: u32, h: u32, frames: u32) -> GifInfo {
        GifInfo { width: w, height: h, frames, size_bytes: 1000 }
    }

    fn opts() -> CompressionOptions {
        CompressionOptions::default()
    }

    #[test]
    fn best_fit_resize_scales_both_dimensions() {
        let mut o = opts();
        o.resize_enabled = true;
        o.target_width = Some(384);
        o.target_height = Some(256);
        let (w, h) = resize_dimensions(&o, &info(512, 512, 1)).unwrap();
        assert_eq!((w, h), (256, 256));
    }

    #[test]
    fn resize_skipped_when_scale_is_one() {
        let mut o = opts();
        o.resize_enabled = true;
        o.target_width = Some(512);
        o.target_height = Some(512);
        assert!(resize_dimensions(&o, &info(512, 512, 1)).is_none());
    }

    #[test]
    fn resize_never_upscales_with_width_only() {
        let mut o = opts();
        o.resize_enabled = true;
        o.target_width = Some(800);
        assert!(resize_dimensions(&o, &info(512, 512, 1)).is_none());
    }

    #[test]
    fn frame_drop_n3_over_12_frames_keeps_four() {
        let indices = frame_selectors(DropFrames::N3, 12);
        assert_eq!(indices, vec![2, 5, 8, 11]);
    }

    #[test]
    fn frame_drop_none_yields_no_selectors() {
        assert!(frame_selectors(DropFrames::None, 12).is_empty());
    }

    #[test]
    fn build_args_orders_flags_before_path_and_selectors_after() {
        let mut o = opts();
        o.reduce_colors = true;
        o.number_of_colors = 64;
        o.undo_optimizations = true;
        o.drop_frames = DropFrames::N2;
        let args = build_args("in.gif", "out.gif", &o, &info(100, 100, 4));

        let input_idx = args.iter().position(|a| a == "in.gif").unwrap();
        let output_idx = args.iter().position(|a| a == "--output").unwrap();
        assert!(args.contains(&"--unoptimize".to_string()));
        assert!(args.contains(&"--colors=64".to_string()));
        assert!(input_idx < output_idx);
        assert!(args[input_idx + 1] == "#1" || args.iter().any(|a| a == "#1"));
    }

    #[test]
    fn probe_output_parses_screen_and_image_count() {
        let text = "in.gif 1.23 logical screen 640x480\n3 images\n";
        let dims = SCREEN_RE.captures(text).map(|c| {
            (c[1].parse::<u32>().unwrap(), c[2].parse::<u32>().unwrap())
        });
        let frames = IMAGES_RE.captures(text).map(|c| c[1].parse::<u32>().unwrap());
        assert_eq!(dims, Some((640, 480)));
        assert_eq!(frames, Some(3));
    }
}
