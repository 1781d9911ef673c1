//! Tab-separated waveform files.
//!
//! Layout: `<out_dir>/<device>/<device>WFS_<channel>_<start>_<end>.tsv`, where start
//! and end are the capture window in local time. Each file starts with one comment
//! line per metadata PV, followed by a `Time` column and the channel column:
//!
//! ```text
//! # R1M1GSET	12.5
//! # R1M1MODE	"GDR"
//! Time	GMES
//! 0.0	0.00000e+00
//! 0.2	7.07107e-01
//! ```
//!
//! Files are written under a temporary name and renamed into place, so a reader
//! never sees a partial waveform.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use tracing::debug;

use super::{SinkError, WaveformSink};
use crate::device::Waveform;

const FILE_TIMESTAMP_FORMAT: &str = "%Y_%m_%d_%H-%M-%S-%6f";

/// Writes each waveform to its own TSV file.
#[derive(Debug, Clone)]
pub struct TsvFileSink {
    out_dir: PathBuf,
}

impl TsvFileSink {
    /// Sink writing below `out_dir`.
    pub fn new(out_dir: PathBuf) -> Self {
        Self { out_dir }
    }

    /// Run output directory.
    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Final path of `waveform`'s file.
    pub fn path_for(&self, waveform: &Waveform) -> PathBuf {
        let device = waveform.device.as_str();
        self.out_dir.join(device).join(format!(
            "{device}WFS_{}_{}_{}.tsv",
            waveform.channel,
            file_timestamp(waveform.window.start),
            file_timestamp(waveform.window.end),
        ))
    }
}

fn file_timestamp(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local)
        .format(FILE_TIMESTAMP_FORMAT)
        .to_string()
}

/// `printf`-style `%.5e`: five decimals and an exponent of at least two digits with sign.
pub fn format_scientific(value: f64) -> String {
    if !value.is_finite() {
        return value.to_string().to_lowercase();
    }
    let formatted = format!("{value:.5e}");
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{mantissa}e{sign}{:02}", exponent.abs())
        }
        None => formatted,
    }
}

fn write_tsv(path: &Path, waveform: &Waveform) -> Result<(), SinkError> {
    let io_error = |source| SinkError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = BufWriter::new(File::create(path).map_err(io_error)?);
    for (key, value) in &waveform.metadata.floats {
        writeln!(file, "# {key}\t{value:?}").map_err(io_error)?;
    }
    for (key, value) in &waveform.metadata.strings {
        writeln!(file, "# {key}\t\"{value}\"").map_err(io_error)?;
    }

    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(file);
    writer.write_record(["Time", waveform.channel.as_str()])?;
    for (time, sample) in waveform.time_axis().zip(&waveform.samples) {
        writer.write_record([format!("{time:?}"), format_scientific(*sample)])?;
    }
    writer.flush().map_err(io_error)?;
    let file = writer
        .into_inner()
        .map_err(|err| io_error(err.into_error()))?;
    file.into_inner()
        .map_err(|err| io_error(err.into_error()))?
        .sync_all()
        .map_err(io_error)
}

#[async_trait]
impl WaveformSink for TsvFileSink {
    async fn write(&self, waveform: &Waveform) -> Result<(), SinkError> {
        let path = self.path_for(waveform);
        let waveform = waveform.clone();
        tokio::task::spawn_blocking(move || {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir).map_err(|source| SinkError::Io {
                    path: dir.to_path_buf(),
                    source,
                })?;
            }
            let partial = path.with_extension("tsv.partial");
            if let Err(err) = write_tsv(&partial, &waveform) {
                let _ = fs::remove_file(&partial);
                return Err(err);
            }
            fs::rename(&partial, &path).map_err(|source| SinkError::Io {
                path: path.clone(),
                source,
            })?;
            debug!(path = %path.display(), "waveform written");
            Ok(())
        })
        .await
        .map_err(|err| SinkError::Rejected(format!("writer task failed: {err}")))?
    }

    fn kind(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CaptureMetadata, CaptureWindow, DeviceId};
    use std::sync::Arc;

    #[test]
    fn scientific_format_matches_printf() {
        assert_eq!(format_scientific(1.0), "1.00000e+00");
        assert_eq!(format_scientific(-0.000123456), "-1.23456e-04");
        assert_eq!(format_scientific(0.0), "0.00000e+00");
        assert_eq!(format_scientific(6.02e23), "6.02000e+23");
        assert_eq!(format_scientific(1e-100), "1.00000e-100");
        assert_eq!(format_scientific(f64::NAN), "nan");
    }

    fn waveform() -> Waveform {
        let mut metadata = CaptureMetadata::default();
        metadata.floats.insert("R1M1GSET".into(), 12.5);
        metadata.strings.insert("R1M1MODE".into(), "GDR".into());
        let when = Utc::now();
        Waveform {
            device: DeviceId::new("R1M1"),
            channel: "GMES".into(),
            samples: vec![0.0, 1.0, -2.5],
            captured_at: when,
            window: CaptureWindow {
                start: when,
                end: when + chrono::Duration::milliseconds(30),
            },
            sample_interval: 0.2,
            metadata: Arc::new(metadata),
        }
    }

    #[tokio::test]
    async fn writes_header_and_columns() {
        let dir = tempfile::tempdir().unwrap();
        let sink = TsvFileSink::new(dir.path().to_path_buf());
        let waveform = waveform();

        sink.write(&waveform).await.unwrap();

        let path = sink.path_for(&waveform);
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("R1M1WFS_GMES_"), "{name}");
        assert!(path.parent().unwrap().ends_with("R1M1"));

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(
            lines,
            vec![
                "# R1M1GSET\t12.5",
                "# R1M1MODE\t\"GDR\"",
                "Time\tGMES",
                "0.0\t0.00000e+00",
                "0.2\t1.00000e+00",
                "0.4\t-2.50000e+00",
            ]
        );

        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "partial"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn unwritable_directory_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"not a directory").unwrap();

        let sink = TsvFileSink::new(blocker);
        let err = sink.write(&waveform()).await.unwrap_err();
        assert!(matches!(err, SinkError::Io { .. }), "{err}");
    }
}
