use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "engine-bench")]
#[command(author, version, about = "Compare LLM inference engines under identical load", long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file
    pub config: PathBuf,

    /// Check configured engines and exit without running load
    #[arg(long)]
    pub check: bool,
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
    fn test_parse() {
        let cli = Cli::parse_from(["engine-bench", "compare.toml"]);
        assert_eq!(cli.config, PathBuf::from("compare.toml"));
        assert!(!cli.check);

        let cli = Cli::parse_from(["engine-bench", "--check", "compare.toml"]);
        assert!(cli.check);
    }
}
