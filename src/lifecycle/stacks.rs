//! Multi-page image-stack recompression.
//!
//! Raw acquisition stacks arrive as large multi-page TIFF files. Each valid
//! stack is re-encoded losslessly (Deflate) into one output stack named for
//! the global frame-index range it covers, so later processing can re-order
//! and range-query frames without reopening files. Candidate files that are
//! not real multi-page stacks are skipped, not treated as errors. Optional
//! post-write verification re-decodes every output frame and byte-compares
//! it against the source before the source becomes eligible for deletion.

use crate::error::{AppResult, VrError};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, compression::Deflate, TiffEncoder};
use tiff::tags::Tag;

/// Stack recompression settings.
#[derive(Debug, Clone)]
pub struct StackSettings {
    /// Pages decoded per batch while processing a single stack.
    pub batch_size: usize,
    /// Worker threads; stacks are independent, one stack per worker.
    pub workers: usize,
    /// Re-decode and byte-compare every written frame. Holding both
    /// representations at least doubles peak memory per worker.
    pub verify: bool,
    /// Delete each source stack after successful (verified) recompression.
    pub remove_sources: bool,
}

impl Default for StackSettings {
    fn default() -> Self {
        Self {
            batch_size: 250,
            workers: 8,
            verify: true,
            remove_sources: false,
        }
    }
}

/// Outcome of a directory recompression pass.
#[derive(Debug, Default)]
pub struct StackReport {
    /// Stacks successfully recompressed.
    pub recompressed: usize,
    /// Total frames written across all outputs.
    pub frames: usize,
    /// Candidate files that failed the stack probe and were skipped.
    pub skipped: Vec<PathBuf>,
}

/// One decoded frame in its native bit depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameData {
    U8(Vec<u8>),
    U16(Vec<u16>),
}

impl FrameData {
    fn from_decoding(result: DecodingResult) -> Option<Self> {
        match result {
            DecodingResult::U8(data) => Some(FrameData::U8(data)),
            DecodingResult::U16(data) => Some(FrameData::U16(data)),
            _ => None,
        }
    }
}

/// Header-level facts about a candidate stack file.
#[derive(Debug, Clone)]
pub struct StackProbe {
    pub pages: usize,
    pub width: u32,
    pub height: u32,
}

/// Probes whether a file is a readable image stack.
///
/// Returns `None` for anything the TIFF decoder rejects or whose pixel type
/// is unsupported; such files are excluded from compression, not errors.
pub fn probe_stack(path: &Path) -> Option<StackProbe> {
    let file = File::open(path).ok()?;
    let mut decoder = Decoder::new(file).ok()?;
    let (width, height) = decoder.dimensions().ok()?;
    let mut pages = 1;
    while decoder.more_images() {
        decoder.next_image().ok()?;
        pages += 1;
    }
    Some(StackProbe {
        pages,
        width,
        height,
    })
}

/// Stack-invariant acquisition parameters extracted once per session.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AcquisitionMetadata {
    /// Volumetric frame rate in Hz.
    pub frame_rate_hz: Option<f64>,
    /// Pixel pitch in micrometers per pixel.
    pub pixel_pitch_um: Option<f64>,
    /// Number of imaging planes.
    pub plane_count: u32,
    /// ROI width in pixels.
    pub roi_width_px: u32,
    /// ROI height in pixels.
    pub roi_height_px: u32,
}

impl AcquisitionMetadata {
    /// The companion descriptor in the schema the downstream
    /// cell-segmentation tool expects.
    pub fn to_ops_json(&self) -> serde_json::Value {
        serde_json::json!({
            "fs": self.frame_rate_hz.unwrap_or(0.0),
            "nplanes": self.plane_count,
            "nrois": 1,
            "Lx": self.roi_width_px,
            "Ly": self.roi_height_px,
        })
    }
}

fn parse_description_value(description: &str, key: &str) -> Option<f64> {
    for line in description.lines() {
        let mut parts = line.splitn(2, '=');
        let name = parts.next()?.trim();
        if name.eq_ignore_ascii_case(key) {
            return parts.next()?.trim().parse().ok();
        }
    }
    None
}

/// Extracts the frame-invariant metadata from any one stack of a session.
pub fn extract_acquisition_metadata(path: &Path) -> AppResult<AcquisitionMetadata> {
    let file = File::open(path)?;
    let mut decoder = Decoder::new(file)?;
    let (width, height) = decoder.dimensions()?;
    let description = decoder
        .get_tag_ascii_string(Tag::ImageDescription)
        .unwrap_or_default();
    Ok(AcquisitionMetadata {
        frame_rate_hz: parse_description_value(&description, "frame_rate_hz"),
        pixel_pitch_um: parse_description_value(&description, "pixel_pitch_um"),
        plane_count: parse_description_value(&description, "plane_count")
            .map(|value| value as u32)
            .unwrap_or(1),
        roi_width_px: width,
        roi_height_px: height,
    })
}

/// Work item: one input stack and the global frame range it covers.
#[derive(Debug, Clone)]
struct StackJob {
    source: PathBuf,
    probe: StackProbe,
    first_frame: usize,
}

fn output_name(first_frame: usize, last_frame: usize) -> String {
    format!("frames_{:06}_{:06}.tif", first_frame, last_frame)
}

/// Recompresses every valid stack in `input_dir` into `output_dir`.
///
/// Stacks are processed in filename order for frame-index assignment, then
/// fan out over the worker pool (one stack per worker). Returns what was
/// done and what was skipped.
pub fn recompress_directory(
    input_dir: &Path,
    output_dir: &Path,
    settings: &StackSettings,
) -> AppResult<StackReport> {
    fs::create_dir_all(output_dir)?;

    // Candidate files in name order: names embed the stack sequence, so
    // this order is the global frame order.
    let mut candidates: Vec<PathBuf> = fs::read_dir(input_dir)?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| {
            path.is_file()
                && matches!(
                    path.extension().and_then(|extension| extension.to_str()),
                    Some("tif") | Some("tiff")
                )
                // Output stacks of a previous (possibly interrupted) pass are
                // never candidates; this keeps re-invocation idempotent.
                && !path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .unwrap_or_default()
                    .starts_with("frames_")
        })
        .collect();
    candidates.sort();

    let mut report = StackReport::default();
    let mut jobs = Vec::new();
    let mut next_frame = 1usize;
    for candidate in candidates {
        match probe_stack(&candidate) {
            Some(probe) => {
                let pages = probe.pages;
                jobs.push(StackJob {
                    source: candidate,
                    probe,
                    first_frame: next_frame,
                });
                next_frame += pages;
            }
            None => {
                log::warn!(
                    "Skipping {}: not a readable image stack",
                    candidate.display()
                );
                report.skipped.push(candidate);
            }
        }
    }

    let failures: Mutex<Vec<VrError>> = Mutex::new(Vec::new());
    let next_index = AtomicUsize::new(0);
    let workers = settings.workers.clamp(1, jobs.len().max(1));

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let index = next_index.fetch_add(1, Ordering::Relaxed);
                if index >= jobs.len() {
                    break;
                }
                if let Err(error) = recompress_stack(&jobs[index], output_dir, settings) {
                    if let Ok(mut sink) = failures.lock() {
                        sink.push(error);
                    }
                }
            });
        }
    });

    let mut failures = failures
        .into_inner()
        .map_err(|_| VrError::Hardware("stack worker poisoned the failure list".into()))?;
    if let Some(error) = failures.pop() {
        return Err(error);
    }

    report.recompressed = jobs.len();
    report.frames = jobs.iter().map(|job| job.probe.pages).sum();
    Ok(report)
}

/// Recompresses one stack: batched decode, Deflate-encoded multi-page
/// output, per-frame variant metadata sidecar, optional verification.
fn recompress_stack(job: &StackJob, output_dir: &Path, settings: &StackSettings) -> AppResult<()> {
    let last_frame = job.first_frame + job.probe.pages - 1;
    let output_path = output_dir.join(output_name(job.first_frame, last_frame));
    let sidecar_path = output_path.with_extension("meta.txt");

    let mut decoder = Decoder::new(File::open(&job.source)?)?;
    let mut encoder = TiffEncoder::new(File::create(&output_path)?)?;
    let mut variant_lines = Vec::with_capacity(job.probe.pages);

    let mut remaining = job.probe.pages;
    let mut first_page = true;
    while remaining > 0 {
        // Decode one bounded batch, then write it out before decoding more,
        // capping per-worker memory at batch_size frames.
        let batch_pages = remaining.min(settings.batch_size);
        let mut batch: Vec<FrameData> = Vec::with_capacity(batch_pages);
        for _ in 0..batch_pages {
            if !first_page {
                decoder.next_image()?;
            }
            first_page = false;
            variant_lines.push(
                decoder
                    .get_tag_ascii_string(Tag::ImageDescription)
                    .unwrap_or_default()
                    .replace('\n', " "),
            );
            let frame = FrameData::from_decoding(decoder.read_image()?).ok_or_else(|| {
                VrError::Hardware(format!(
                    "unsupported pixel type in stack {}",
                    job.source.display()
                ))
            })?;
            batch.push(frame);
        }
        for frame in &batch {
            match frame {
                FrameData::U8(data) => encoder.write_image_with_compression::<colortype::Gray8, _>(
                    job.probe.width,
                    job.probe.height,
                    Deflate::default(),
                    data,
                )?,
                FrameData::U16(data) => encoder
                    .write_image_with_compression::<colortype::Gray16, _>(
                        job.probe.width,
                        job.probe.height,
                        Deflate::default(),
                        data,
                    )?,
            }
        }
        remaining -= batch_pages;
    }
    drop(encoder);

    fs::write(&sidecar_path, variant_lines.join("\n"))?;

    if settings.verify {
        verify_stack(&job.source, &output_path)?;
    }
    if settings.remove_sources {
        if !settings.verify {
            log::warn!(
                "Removing {} without verification; enable verify to gate deletion",
                job.source.display()
            );
        }
        fs::remove_file(&job.source)?;
    }
    log::info!(
        "Recompressed {} -> {}",
        job.source.display(),
        output_path.display()
    );
    Ok(())
}

/// Decodes both stacks in lockstep and byte-compares every frame.
fn verify_stack(source: &Path, output: &Path) -> AppResult<()> {
    let mut source_decoder = Decoder::new(File::open(source)?)?;
    let mut output_decoder = Decoder::new(File::open(output)?)?;
    let mut page = 0usize;
    loop {
        let original = FrameData::from_decoding(source_decoder.read_image()?);
        let rewritten = FrameData::from_decoding(output_decoder.read_image()?);
        if original != rewritten {
            return Err(VrError::Hardware(format!(
                "recompressed frame {page} of {} differs from its source",
                source.display()
            )));
        }
        page += 1;
        match (source_decoder.more_images(), output_decoder.more_images()) {
            (true, true) => {
                source_decoder.next_image()?;
                output_decoder.next_image()?;
            }
            (false, false) => return Ok(()),
            _ => {
                return Err(VrError::Hardware(format!(
                    "recompressed stack {} has a different page count than its source",
                    output.display()
                )));
            }
        }
    }
}
