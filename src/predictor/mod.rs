//! Two-layer processing-time predictor: a frozen ridge-regression baseline
//! shipped as an embedded artifact, plus a residual-learning layer that
//! nudges the baseline using exponential moving averages keyed by coarse
//! job buckets.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::Deserialize;
use tracing::debug;

use crate::db::JobRepository;
use crate::error::Result;
use crate::models::{CompressionOptions, DropFrames, GifInfo, PredictionSample};

#[derive(Debug, Deserialize)]
struct FeatureWeight {
    name: String,
    weight: f64,
    mean: f64,
    scale: f64,
}

#[derive(Debug, Deserialize)]
struct BaselineModel {
    intercept: f64,
    features: Vec<FeatureWeight>,
}

static BASELINE: Lazy<BaselineModel> = Lazy::new(|| {
    serde_json::from_str(include_str!("../../data/predictor_baseline.json"))
        .expect("embedded predictor baseline must parse")
});

const RESIDUAL_ALPHA: f64 = 0.3;
const RESIDUAL_CLAMP: f64 = 0.5;
const RESIDUAL_MIN_COUNT: i64 = 3;

fn baseline_predict(features: &HashMap<&'static str, f64>) -> f64 {
    let mut total = BASELINE.intercept;
    for fw in &BASELINE.features {
        if fw.scale == 0.0 {
            continue;
        }
        let Some(value) = features.get(fw.name.as_str()) else { continue };
        total += fw.weight * (value - fw.mean) / fw.scale;
    }
    total
}

/// Builds the exact feature set used by both training and runtime.
fn compute_features(info: &GifInfo, options: &CompressionOptions, file_size_bytes: f64) -> HashMap<&'static str, f64> {
    let target_width = options.target_width.unwrap_or(info.width) as f64;
    let target_height = options.target_height.unwrap_or(info.height) as f64;
    let total_pixels = info.frames as f64 * info.width as f64 * info.height as f64;
    let target_pixels = info.frames as f64 * target_width * target_height;
    let number_of_colors = if options.reduce_colors { options.number_of_colors as f64 } else { 256.0 };

    let mut features = HashMap::new();
    features.insert("total_pixels", total_pixels);
    features.insert("target_pixels", target_pixels);
    features.insert("frames", info.frames as f64);
    features.insert("file_size_bytes", file_size_bytes);
    features.insert("target_width", target_width);
    features.insert("target_height", target_height);
    features.insert("number_of_colors", number_of_colors);
    features.insert("compression_level", options.compression_level as f64);
    features.insert("reduce_colors", bool_feature(options.reduce_colors));
    features.insert("optimize_transparency", bool_feature(options.optimize_transparency));
    features.insert("undo_optimizations", bool_feature(options.undo_optimizations));
    features.insert("drop_frames_none", bool_feature(options.drop_frames == DropFrames::None));
    features.insert("drop_frames_n2", bool_feature(options.drop_frames == DropFrames::N2));
    features.insert("drop_frames_n3", bool_feature(options.drop_frames == DropFrames::N3));
    features.insert("drop_frames_n4", bool_feature(options.drop_frames == DropFrames::N4));
    features
}

fn bool_feature(value: bool) -> f64 {
    if value { 1.0 } else { 0.0 }
}

fn size_group(target_pixels: f64) -> &'static str {
    if target_pixels < 2e5 {
        "xs"
    } else if target_pixels < 1e6 {
        "s"
    } else if target_pixels < 4e6 {
        "m"
    } else {
        "l"
    }
}

fn compression_bucket(level: u32) -> &'static str {
    if level == 0 {
        "none"
    } else if level < 50 {
        "low"
    } else if level < 100 {
        "medium"
    } else {
        "high"
    }
}

/// The coarse residual keys this job contributes to / draws corrections from.
fn residual_keys(options: &CompressionOptions, target_pixels: f64) -> Vec<String> {
    vec![
        format!("size_group={}", size_group(target_pixels)),
        format!("optimize_transparency={}", bool_feature(options.optimize_transparency) as i32),
        format!("reduce_colors={}", bool_feature(options.reduce_colors) as i32),
        format!("undo_optimizations={}", bool_feature(options.undo_optimizations) as i32),
        format!("drop_frames={}", options.drop_frames.as_str()),
        format!("compression_bucket={}", compression_bucket(options.compression_level)),
    ]
}

pub struct Predictor {
    repo: Arc<JobRepository>,
}

impl Predictor {
    pub fn new(repo: Arc<JobRepository>) -> Self {
        debug!("predictor baseline loaded with {} features", BASELINE.features.len());
        Self { repo }
    }

    /// Estimates processing time in milliseconds; always positive.
    pub async fn predict(&self, info: &GifInfo, options: &CompressionOptions, file_size_bytes: u64) -> Result<i64> {
        let features = compute_features(info, options, file_size_bytes as f64);
        let target_pixels = *features.get("target_pixels").unwrap_or(&0.0);

        let baseline_log_seconds = baseline_predict(&features);

        let keys = residual_keys(options, target_pixels);
        let mut active = Vec::new();
        for key in &keys {
            if let Some(entry) = self.repo.get_residual(key).await? {
                if entry.count >= RESIDUAL_MIN_COUNT {
                    active.push(entry.ema.clamp(-RESIDUAL_CLAMP, RESIDUAL_CLAMP));
                }
            }
        }
        let avg_residual = if active.is_empty() {
            0.0
        } else {
            active.iter().sum::<f64>() / active.len() as f64
        };

        let log_seconds = baseline_log_seconds + avg_residual;
        let seconds = log_seconds.exp_m1();
        let ms = (seconds * 1000.0).round() as i64;
        Ok(ms.max(100))
    }

    /// Fallback estimate used only if the embedded baseline cannot be evaluated.
    #[allow(dead_code)]
    fn fallback(total_pixels: f64) -> f64 {
        (total_pixels * 1e-7 + 0.5).ln_1p()
    }

    /// Records the completed job's actual duration and updates residual EMAs.
    pub async fn record_completion(
        &self,
        job_id: &str,
        info: &GifInfo,
        options: &CompressionOptions,
        file_size_bytes: u64,
        actual_ms: i64,
    ) -> Result<()> {
        let features = compute_features(info, options, file_size_bytes as f64);
        let target_pixels = *features.get("target_pixels").unwrap_or(&0.0);
        let baseline_log_seconds = baseline_predict(&features);

        let actual_log_seconds = ((actual_ms.max(1) as f64) / 1000.0).ln_1p();
        let residual = actual_log_seconds - baseline_log_seconds;

        let sample = PredictionSample {
            job_id: job_id.to_string(),
            total_pixels: *features.get("total_pixels").unwrap_or(&0.0),
            target_pixels,
            frames: *features.get("frames").unwrap_or(&0.0),
            file_size_bytes: file_size_bytes as f64,
            target_width: *features.get("target_width").unwrap_or(&0.0),
            target_height: *features.get("target_height").unwrap_or(&0.0),
            number_of_colors: *features.get("number_of_colors").unwrap_or(&0.0),
            compression_level: options.compression_level as f64,
            reduce_colors: options.reduce_colors,
            optimize_transparency: options.optimize_transparency,
            undo_optimizations: options.undo_optimizations,
            drop_frames: options.drop_frames,
            actual_ms,
            created_at: chrono::Utc::now(),
        };
        self.repo.insert_sample(&sample).await?;

        for key in residual_keys(options, target_pixels) {
            match self.repo.get_residual(&key).await? {
                Some(existing) => {
                    let ema = RESIDUAL_ALPHA * residual + (1.0 - RESIDUAL_ALPHA) * existing.ema;
                    self.repo.upsert_residual(&key, ema, existing.count + 1).await?;
                }
                None => {
                    self.repo.upsert_residual(&key, residual, 1).await?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_model_loads_and_has_expected_feature_count() {
        assert!(BASELINE.features.len() >= 14);
    }

    #[test]
    fn size_group_buckets_by_byte_thresholds() {
        assert_eq!(size_group(1.0), "xs");
        assert_eq!(size_group(2e5), "s");
        assert_eq!(size_group(1e6), "m");
        assert_eq!(size_group(4e6), "l");
    }

    #[test]
    fn compression_bucket_buckets_by_level_thresholds() {
        assert_eq!(compression_bucket(0), "none");
        assert_eq!(compression_bucket(49), "low");
        assert_eq!(compression_bucket(99), "medium");
        assert_eq!(compression_bucket(150), "high");
    }

    #[test]
    fn residual_ema_closed_form_matches_iterative_update() {
        let alpha = RESIDUAL_ALPHA;
        let residuals = [0.2, -0.1, 0.05, 0.3];
        let mut ema = residuals[0];
        for r in &residuals[1..] {
            ema = alpha * r + (1.0 - alpha) * ema;
        }

        let k = residuals.len() - 1;
        let closed_form: f64 = residuals[1..]
            .iter()
            .enumerate()
            .map(|(i, r)| alpha * (1.0 - alpha).powi((k - 1 - i) as i32) * r)
            .sum::<f64>()
            + (1.0 - alpha).powi(k as i32) * residuals[0];

        assert!((ema - closed_form).abs() < 1e-9);
    }

    #[tokio::test]
    async fn predict_is_always_at_least_100ms() {
        let repo = Arc::new(JobRepository::in_memory().await.unwrap());
        let predictor = Predictor::new(repo);
        let info = GifInfo { width: 10, height: 10, frames: 1, size_bytes: 100 };
        let options = CompressionOptions::default();
        let ms = predictor.predict(&info, &options, 100).await.unwrap();
        assert!(ms >= 100);
    }

    #[tokio::test]
    async fn record_completion_makes_residual_active_after_three_samples() {
        let repo = Arc::new(JobRepository::in_memory().await.unwrap());
        let predictor = Predictor::new(repo.clone());
        let info = GifInfo { width: 100, height: 100, frames: 10, size_bytes: 50_000 };
        let options = CompressionOptions::default();

        for i in 0..3 {
            predictor
                .record_completion(&format!("job-{i}"), &info, &options, 50_000, 5_000)
                .await
                .unwrap();
        }

        let key = format!(
            "compression_bucket={}",
            compression_bucket(options.compression_level)
        );
        let entry = repo.get_residual(&key).await.unwrap().unwrap();
        assert_eq!(entry.count, 3);
    }
}
