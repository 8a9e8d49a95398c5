//! Z-stack time series export
//!
//! An [`ExportJob`] turns every selected (frame, channel) volume of a
//! [`VolumeSeries`] into one grid file under
//! `<dir>/ch<c>/vol_ch<c>_fr<fff>.vdb`. Cropping happens before
//! normalisation, and normalisation uses the intensity range of the whole
//! time series of a channel so frames stay comparable.

use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::builder::GridBuilder;
use crate::config::{ExportConfig, RawSource, SampleType};
use crate::container::{GridSerializer, Metadata};
use crate::error::{invalid_volume, IoContext, VdbResult};
use crate::transform::Transform;
use crate::volume::{dense_len, Volume};

/// Volumes indexed by frame and channel, all with the same dimensions
#[derive(Debug, Clone)]
pub struct VolumeSeries {
    frames: usize,
    channels: usize,
    /// Channel-major: `channel * frames + frame`
    volumes: Vec<Volume>,
}

impl VolumeSeries {
    pub fn new(frames: usize, channels: usize, volumes: Vec<Volume>) -> VdbResult<Self> {
        if frames == 0 || channels == 0 {
            return Err(invalid_volume("a series needs at least one frame and one channel"));
        }
        if frames.checked_mul(channels) != Some(volumes.len()) {
            return Err(invalid_volume(format!(
                "{} volumes for {} frames x {} channels",
                volumes.len(),
                frames,
                channels
            )));
        }
        let dims = volumes[0].dims();
        if let Some(other) = volumes.iter().find(|v| v.dims() != dims) {
            return Err(invalid_volume(format!(
                "series mixes volume dimensions {:?} and {:?}",
                dims,
                other.dims()
            )));
        }

        Ok(Self {
            frames,
            channels,
            volumes,
        })
    }

    /// Single-frame, single-channel series
    pub fn single(volume: Volume) -> Self {
        Self {
            frames: 1,
            channels: 1,
            volumes: vec![volume],
        }
    }

    /// Decode a raw little-endian stack
    pub fn from_raw(source: &RawSource) -> VdbResult<Self> {
        let data = std::fs::read(&source.path).io_context("read raw stack", &source.path)?;
        Self::from_raw_bytes(&data, source.dims, source.sample)
    }

    /// Decode raw samples laid out x fastest, then y, z, frame and channel
    pub fn from_raw_bytes(data: &[u8], dims: [usize; 5], sample: SampleType) -> VdbResult<Self> {
        let [nx, ny, nz, frames, channels] = dims;
        if dims.iter().any(|&d| d == 0) {
            return Err(invalid_volume(format!("raw dimensions {:?} contain zero", dims)));
        }
        let voxels = dense_len([nx, ny, nz])?;
        let stride = voxels
            .checked_mul(sample.width())
            .ok_or_else(|| invalid_volume(format!("raw dimensions {:?} overflow", dims)))?;
        let expected = stride
            .checked_mul(frames)
            .and_then(|n| n.checked_mul(channels))
            .ok_or_else(|| invalid_volume(format!("raw dimensions {:?} overflow", dims)))?;
        if data.len() != expected {
            return Err(invalid_volume(format!(
                "raw stack of {:?} {:?} samples needs {} bytes, found {}",
                dims,
                sample,
                expected,
                data.len()
            )));
        }

        let volumes = data
            .chunks_exact(stride)
            .map(|chunk| match sample {
                SampleType::U8 => Volume::from_u8([nx, ny, nz], chunk, [1.0; 3], [0.0; 3]),
                SampleType::U16 => {
                    let samples = chunk
                        .chunks_exact(2)
                        .map(|b| u16::from_le_bytes([b[0], b[1]]))
                        .collect::<Vec<_>>();
                    Volume::from_u16([nx, ny, nz], &samples, [1.0; 3], [0.0; 3])
                }
            })
            .collect::<VdbResult<Vec<_>>>()?;

        Self::new(frames, channels, volumes)
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn get(&self, frame: usize, channel: usize) -> Option<&Volume> {
        if frame >= self.frames || channel >= self.channels {
            return None;
        }
        self.volumes.get(channel * self.frames + frame)
    }

    /// Every frame of one channel, in frame order
    pub fn channel(&self, channel: usize) -> &[Volume] {
        let start = (channel * self.frames).min(self.volumes.len());
        let end = (start + self.frames).min(self.volumes.len());
        &self.volumes[start..end]
    }
}

/// Files produced by one export run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportReport {
    pub files: Vec<PathBuf>,
    pub active_voxels: u64,
}

/// Writes one grid file per selected frame and channel
#[derive(Debug, Clone)]
pub struct ExportJob {
    config: ExportConfig,
}

impl ExportJob {
    pub fn new(config: ExportConfig) -> VdbResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    /// Location of the file for one frame of one channel
    pub fn output_path(dir: &Path, channel: usize, frame: usize) -> PathBuf {
        dir.join(format!("ch{}", channel))
            .join(format!("vol_ch{}_fr{:03}.vdb", channel, frame))
    }

    pub fn run(&self, series: &VolumeSeries) -> VdbResult<ExportReport> {
        let start = Instant::now();
        let data = &self.config.data;
        let frames = data.frame_selection().resolve(series.frames(), "frame")?;
        let channels = data.channels.resolve(series.channels(), "channel")?;

        let builder = GridBuilder::new(self.config.build_options()?);
        let serializer = GridSerializer::new(self.config.write_options());
        let spacing = self.config.spacing();

        log::info!(
            "Exporting {} frame(s) x {} channel(s) to {}",
            frames.len(),
            channels.len(),
            self.config.output.dir.display()
        );

        let mut report = ExportReport::default();
        for &channel in &channels {
            let dir = self.config.output.dir.join(format!("ch{}", channel));
            std::fs::create_dir_all(&dir).io_context("create directory", &dir)?;

            let volumes = self.prepare_channel(series.channel(channel))?;
            for &frame in &frames {
                let volume = &volumes[frame];
                let tree = builder.build(volume)?;
                let transform = Transform::build(spacing, volume.origin())?;

                let mut metadata = Metadata::for_density_grid(&self.config.grid.name);
                metadata.insert("channel", channel as i64);
                metadata.insert("frame", frame as i64);

                let path = Self::output_path(&self.config.output.dir, channel, frame);
                serializer.write_file(&tree, &transform, &metadata, &path)?;

                report.active_voxels += tree.active_voxel_count();
                report.files.push(path);
            }
        }

        log::info!(
            "Exported {} file(s) in {:.2?}",
            report.files.len(),
            start.elapsed()
        );
        Ok(report)
    }

    /// Crop and normalise every frame of one channel
    fn prepare_channel(&self, volumes: &[Volume]) -> VdbResult<Vec<Volume>> {
        let data = &self.config.data;
        let cropped = match &data.roi {
            Some(roi) => volumes
                .iter()
                .map(|v| v.crop(roi))
                .collect::<VdbResult<Vec<_>>>()?,
            None => volumes.to_vec(),
        };

        if !data.normalize {
            return Ok(cropped);
        }

        let (min, max) = cropped
            .iter()
            .map(Volume::value_range)
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), (a, b)| {
                (lo.min(a), hi.max(b))
            });
        log::debug!("Normalising intensities {}..{} to 0..255", min, max);
        Ok(cropped.iter().map(|v| v.normalized(min, max)).collect())
    }
}

/// Export a single volume with the given configuration and return its path
pub fn export_volume(config: &ExportConfig, volume: Volume) -> VdbResult<PathBuf> {
    let job = ExportJob::new(config.clone())?;
    let report = job.run(&VolumeSeries::single(volume))?;
    report
        .files
        .into_iter()
        .next()
        .ok_or_else(|| invalid_volume("the frame and channel selection is empty"))
}
