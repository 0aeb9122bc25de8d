use anyhow::{Context, Result, anyhow};
use hound::WavReader;
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use crate::ir::SoundBuffer;

/// Scans a directory tree for impulse response WAV files and loads them
/// into [`SoundBuffer`]s, channel layout preserved.
pub struct IrLoader {
    available_ir_paths: Vec<(String, PathBuf)>,
    ir_directory: PathBuf,
    expected_sample_rate: u32,
}

impl IrLoader {
    pub fn new(directory: &Path, expected_sample_rate: u32) -> Result<IrLoader> {
        let mut loader = IrLoader {
            available_ir_paths: Vec::new(),
            ir_directory: directory.to_path_buf(),
            expected_sample_rate,
        };

        loader.scan_ir_directory()?;

        Ok(loader)
    }

    pub fn available_ir_names(&self) -> Vec<String> {
        self.available_ir_paths
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn get_first(&self) -> Result<SoundBuffer> {
        if self.available_ir_paths.is_empty() {
            return Err(anyhow!("no impulse responses in {:?}", self.ir_directory));
        }

        self.load_ir(&self.available_ir_paths[0].1)
    }

    pub fn load_by_name(&self, name: &str) -> Result<SoundBuffer> {
        for (ir_name, ir_path) in &self.available_ir_paths {
            if ir_name == name {
                return self.load_ir(ir_path);
            }
        }

        Err(anyhow!("ir name '{}' not found", name))
    }

    pub fn load_ir(&self, path: &Path) -> Result<SoundBuffer> {
        let buffer = load_wav(path)?;

        let reader = WavReader::open(path).context("Failed to open WAV file")?;
        let rate = reader.spec().sample_rate;
        if rate != self.expected_sample_rate {
            // Sample-rate conversion is out of scope; a mismatched IR
            // plays time-stretched.
            warn!(
                "IR {:?} is {} Hz, engine runs at {} Hz",
                path, rate, self.expected_sample_rate
            );
        }

        Ok(normalise(buffer))
    }

    /// Walk the IR directory tree and rebuild the name -> path index,
    /// sorted by relative name.
    pub fn scan_ir_directory(&mut self) -> Result<()> {
        if !self.ir_directory.exists() {
            fs::create_dir_all(&self.ir_directory).context("failed to create IR directory")?;
            warn!("IR directory created at {:?}", self.ir_directory);
            return Ok(());
        }

        self.available_ir_paths.clear();

        let mut pending = vec![self.ir_directory.clone()];
        while let Some(dir) = pending.pop() {
            for entry in fs::read_dir(&dir)
                .with_context(|| format!("failed to read IR directory {dir:?}"))?
            {
                let path = entry?.path();
                if path.is_dir() {
                    pending.push(path);
                } else if is_wav(&path) {
                    let name = relative_name(&path, &self.ir_directory);
                    self.available_ir_paths.push((name, path));
                }
            }
        }

        self.available_ir_paths.sort_by(|a, b| a.0.cmp(&b.0));

        info!(
            "{} impulse responses indexed under {:?}",
            self.available_ir_paths.len(),
            self.ir_directory
        );
        Ok(())
    }
}

fn is_wav(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("wav"))
}

/// Name an IR by its path below the scan root, with forward slashes on
/// every platform.
fn relative_name(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// Load a WAV file into an interleaved [`SoundBuffer`], converting
/// integer formats to float.
pub fn load_wav(path: &Path) -> Result<SoundBuffer> {
    let reader = WavReader::open(path).context("Failed to open WAV file")?;
    let spec = reader.spec();

    let samples: Vec<f32> = if spec.sample_format == hound::SampleFormat::Float {
        reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read float samples")?
    } else {
        let max_val = (1i64 << (spec.bits_per_sample - 1)) as f32;
        reader
            .into_samples::<i32>()
            .map(|s| s.map(|v| v as f32 / max_val))
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read integer samples")?
    };

    debug!(
        "loaded {:?}: {} channels, {} frames at {} Hz",
        path,
        spec.channels,
        samples.len() / spec.channels as usize,
        spec.sample_rate
    );

    Ok(SoundBuffer::new(samples, spec.channels as usize))
}

/// Scale the buffer so its peak sits at 0.9, leaving silence untouched.
fn normalise(mut buffer: SoundBuffer) -> SoundBuffer {
    let peak = buffer
        .data
        .iter()
        .fold(0.0f32, |acc, &x| acc.max(x.abs()));

    if peak > 0.0 {
        let gain = 0.9 / peak;
        for s in &mut buffer.data {
            *s *= gain;
        }
    }

    buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_test_wav(path: &Path, channels: u16, frames: usize) -> Result<()> {
        let spec = hound::WavSpec {
            channels,
            sample_rate: 48_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec)?;
        for i in 0..frames {
            for _ in 0..channels {
                writer.write_sample(if i == 0 { i16::MAX / 2 } else { 0 })?;
            }
        }
        writer.finalize()?;
        Ok(())
    }

    #[test]
    fn scan_finds_nested_wavs() -> Result<()> {
        let tmp = TempDir::new()?;
        let ir_dir = tmp.path().join("irs");
        fs::create_dir_all(ir_dir.join("nested"))?;

        write_test_wav(&ir_dir.join("a.wav"), 1, 16)?;
        write_test_wav(&ir_dir.join("nested").join("b.wav"), 1, 16)?;

        let loader = IrLoader::new(&ir_dir, 48_000)?;
        assert_eq!(loader.available_ir_names(), vec!["a.wav", "nested/b.wav"]);
        Ok(())
    }

    #[test]
    fn load_preserves_channel_count() -> Result<()> {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("stereo.wav");
        write_test_wav(&path, 2, 32)?;

        let buffer = load_wav(&path)?;
        assert_eq!(buffer.channels, 2);
        assert_eq!(buffer.frames, 32);
        Ok(())
    }

    #[test]
    fn loaded_ir_is_peak_normalised() -> Result<()> {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("quiet.wav");
        write_test_wav(&path, 1, 16)?;

        let loader = IrLoader::new(tmp.path(), 48_000)?;
        let buffer = loader.load_by_name("quiet.wav")?;
        let peak = buffer.data.iter().fold(0.0f32, |a, &x| a.max(x.abs()));
        assert!((peak - 0.9).abs() < 1e-4);
        Ok(())
    }
}
