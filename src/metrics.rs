//! Per-iteration statistics stream.
//!
//! Writes one CSV row per optimization step under the run's save path. An
//! existing stats file from a previous run is rotated out of the way
//! rather than clobbered.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

const FILE_NAME: &str = "train_stats.csv";

/// Metrics emitted after every optimization iteration.
#[derive(Clone, Copy, Debug)]
pub struct IterationStats {
    pub step: u64,
    pub energy: f64,
    pub variance: f64,
    pub pmove: f64,
    pub grad_norm: f64,
}

/// Line-buffered CSV writer for the training run.
pub struct StatsWriter {
    file: BufWriter<File>,
}

impl StatsWriter {
    pub fn create(directory: &Path) -> io::Result<Self> {
        fs::create_dir_all(directory)?;
        let path = directory.join(FILE_NAME);
        if path.exists() {
            let stamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            fs::rename(&path, directory.join(format!("train_stats.{stamp}.csv")))?;
        }
        let mut file = BufWriter::new(File::create(&path)?);
        writeln!(file, "step,energy,variance,pmove,grad_norm")?;
        file.flush()?;
        Ok(Self { file })
    }

    pub fn append(&mut self, stats: &IterationStats) -> io::Result<()> {
        writeln!(
            self.file,
            "{},{:.8},{:.8},{:.4},{:.6}",
            stats.step, stats.energy, stats.variance, stats.pmove, stats.grad_norm
        )?;
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("nnvmc-metrics-{tag}-{}", std::process::id()));
        fs::remove_dir_all(&dir).ok();
        dir
    }

    #[test]
    fn test_header_and_rows() {
        let dir = test_dir("rows");
        let mut writer = StatsWriter::create(&dir).unwrap();
        writer
            .append(&IterationStats {
                step: 0,
                energy: -1.5,
                variance: 0.25,
                pmove: 0.55,
                grad_norm: 3.0,
            })
            .unwrap();
        writer
            .append(&IterationStats {
                step: 1,
                energy: -1.6,
                variance: 0.20,
                pmove: 0.54,
                grad_norm: 2.5,
            })
            .unwrap();
        let contents = fs::read_to_string(dir.join(FILE_NAME)).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "step,energy,variance,pmove,grad_norm");
        assert!(lines[1].starts_with("0,-1.5"));
        assert!(lines[2].starts_with("1,-1.6"));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_existing_file_is_rotated() {
        let dir = test_dir("rotate");
        {
            let _writer = StatsWriter::create(&dir).unwrap();
        }
        let _second = StatsWriter::create(&dir).unwrap();
        let rotated = fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.starts_with("train_stats.") && name != FILE_NAME
            })
            .count();
        assert_eq!(rotated, 1);
        fs::remove_dir_all(&dir).ok();
    }
}
