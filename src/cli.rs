use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "stream-bench")]
#[command(author, version, about = "Measure streaming latency, throughput and cost of LLM prompts", long_about = None)]
pub struct Cli {
    /// Path to the TOML run configuration
    pub config: PathBuf,

    /// Override the run name from the configuration
    #[arg(long)]
    pub name: Option<String>,

    /// Override the model from the configuration
    #[arg(long)]
    pub model: Option<String>,
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_overrides() {
        let cli = Cli::try_parse_from([
            "stream-bench",
            "run.toml",
            "--model",
            "claude-3-opus-20240229",
        ])
        .unwrap();

        assert_eq!(cli.config, PathBuf::from("run.toml"));
        assert_eq!(cli.model.as_deref(), Some("claude-3-opus-20240229"));
        assert!(cli.name.is_none());
    }

    #[test]
    fn test_config_is_required() {
        assert!(Cli::try_parse_from(["stream-bench"]).is_err());
    }
}
