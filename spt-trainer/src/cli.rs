use clap::Parser;

/// A self-play training orchestrator with batched model serving.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(default_value = "config.yaml")]
    pub(crate) config_path: String,
}
