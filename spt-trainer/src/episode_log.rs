use anyhow::Context;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::info;

/// One row per training episode.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct Record {
    pub episode: u64,
    pub games_played: u64,
    pub samples_collected: u64,

    pub rollout_time_seconds: f64,
    pub learn_time_seconds: f64,
    pub evaluation_time_seconds: f64,

    pub mean_loss: f64,
    pub win_rate_vs_previous: f64,
    pub win_rate_vs_random: f64,

    pub exploration_factor: f64,
}

/// Append-only CSV episode log. Re-read on startup so an interrupted run
/// resumes from the episode after the last recorded one.
#[derive(Debug)]
pub struct EpisodeLog {
    path: PathBuf,
    records: Vec<Record>,
}

impl EpisodeLog {
    /// Loads records from the CSV file at the given path, or creates a new,
    /// empty file with a header if it doesn't exist.
    pub fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();

        let records = if path.exists() {
            let file = File::open(path)
                .with_context(|| format!("Failed to open episode log at {path:?}"))?;
            let mut rdr = csv::Reader::from_reader(file);
            let records = rdr
                .deserialize()
                .collect::<Result<Vec<Record>, _>>()
                .with_context(|| format!("Failed to parse CSV records from {path:?}"))?;
            info!("Loaded {} existing episode records.", records.len());
            records
        } else {
            info!("No episode log found at {path:?}, creating a new one.");
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create parent directory for episode log at {parent:?}")
                })?;
            }

            // Serialize a default record to obtain the header line, then strip
            // the record itself.
            {
                let file = File::create(path)
                    .with_context(|| format!("Failed to create episode log at {path:?}"))?;
                let mut wtr = csv::Writer::from_writer(file);
                wtr.serialize(Record::default())?;
                wtr.flush()?;
            }

            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read fresh episode log at {path:?}"))?;
            let header = match content.find('\n') {
                Some(index) => &content[..=index],
                None => &content,
            };
            std::fs::write(path, header)
                .with_context(|| format!("Failed to write header to episode log at {path:?}"))?;

            Vec::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            records,
        })
    }

    /// Appends a record to the file and the in-memory list.
    pub fn append(&mut self, record: Record) -> anyhow::Result<()> {
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open episode log for appending at {:?}", self.path))?;

        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        wtr.serialize(&record)
            .with_context(|| format!("Failed to serialize record for episode {}", record.episode))?;
        wtr.flush().context("Failed to flush CSV writer")?;

        self.records.push(record);

        Ok(())
    }

    /// Episode number of the last record, if any.
    pub fn last_episode(&self) -> Option<u64> {
        self.records.last().map(|r| r.episode)
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("spt-episode-log-{tag}-{}.csv", std::process::id()))
    }

    #[test]
    fn fresh_log_starts_empty_and_survives_reload() {
        let path = temp_path("fresh");
        std::fs::remove_file(&path).ok();

        let mut log = EpisodeLog::new(&path).unwrap();
        assert_eq!(log.last_episode(), None);

        log.append(Record {
            episode: 0,
            games_played: 12,
            ..Record::default()
        })
        .unwrap();
        log.append(Record {
            episode: 1,
            games_played: 9,
            ..Record::default()
        })
        .unwrap();

        let reloaded = EpisodeLog::new(&path).unwrap();
        assert_eq!(reloaded.last_episode(), Some(1));
        assert_eq!(reloaded.records().len(), 2);
        assert_eq!(reloaded.records()[0].games_played, 12);

        std::fs::remove_file(&path).ok();
    }
}
