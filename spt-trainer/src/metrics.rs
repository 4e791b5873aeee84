use anyhow::Context;
use spt_core::protocol::MetricsWindow;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

#[derive(Debug, serde::Serialize)]
struct Row<'a> {
    key: &'a str,
    step: u64,
    value: f64,
}

/// Long-format metrics sink: one `key,step,value` row per observation,
/// appended as the run progresses. Cheap to grep and trivially plottable.
pub struct MetricsRecorder {
    path: PathBuf,
}

impl MetricsRecorder {
    pub fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            let file = File::create(path)
                .with_context(|| format!("Failed to create metrics file at {path:?}"))?;
            let mut wtr = csv::Writer::from_writer(file);
            wtr.write_record(["key", "step", "value"])?;
            wtr.flush()?;
        }

        Ok(MetricsRecorder {
            path: path.to_path_buf(),
        })
    }

    pub fn record(&mut self, key: &str, step: u64, value: f64) -> anyhow::Result<()> {
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open metrics file at {:?}", self.path))?;

        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        wtr.serialize(Row { key, step, value })?;
        wtr.flush().context("Failed to flush metrics writer")?;

        Ok(())
    }

    /// Flattens an unlocked metrics window under a key prefix such as
    /// `selfplay/rollout`.
    pub fn record_window(&mut self, prefix: &str, window: &MetricsWindow) -> anyhow::Result<()> {
        let step = window.step;

        for (name, summary) in [
            ("batch_latency_s", &window.batch_latency),
            ("request_delay_s", &window.request_delay),
            ("batch_size", &window.batch_size),
        ] {
            self.record(&format!("{prefix}/{name}_mean"), step, summary.mean)?;
            self.record(&format!("{prefix}/{name}_p95"), step, summary.p95)?;
        }
        self.record(
            &format!("{prefix}/batches"),
            step,
            window.batch_size.count as f64,
        )?;

        Ok(())
    }
}
