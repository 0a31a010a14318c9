//! Command-line interface definition
//!
//! Kept in the library so `xtask` can render the CLI reference.

use clap::{Parser, ValueEnum};

/// rawload - load raw CSV datasets from object storage into PostgreSQL
///
/// Configuration comes from the environment (and `.env`): `DATABASE_URL` or
/// `DB_*`, `S3_*`, `LOADER_*` and `LOG_*` variables.
#[derive(Parser, Debug)]
#[command(name = "rawload")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Drop and recreate the managed schema before loading (destroys existing data)
    #[arg(long)]
    pub force_schema_recreate: bool,

    /// Verify object storage and database access, then exit without loading
    #[arg(long, conflicts_with = "force_schema_recreate")]
    pub check_connections: bool,

    /// Format of the run summary printed on stdout
    #[arg(long, value_enum, default_value_t = SummaryFormat::Text)]
    pub summary_format: SummaryFormat,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Print the CLI reference as markdown
    #[arg(long, hide = true)]
    pub markdown_help: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SummaryFormat {
    Text,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["rawload"]);
        assert!(!cli.force_schema_recreate);
        assert!(!cli.check_connections);
        assert_eq!(cli.summary_format, SummaryFormat::Text);
    }

    #[test]
    fn test_flags() {
        let cli = Cli::parse_from(["rawload", "--force-schema-recreate", "--summary-format", "json", "-v"]);
        assert!(cli.force_schema_recreate);
        assert!(cli.verbose);
        assert_eq!(cli.summary_format, SummaryFormat::Json);
    }

    #[test]
    fn test_check_connections_conflicts_with_recreate() {
        let parsed = Cli::try_parse_from(["rawload", "--check-connections", "--force-schema-recreate"]);
        assert!(parsed.is_err());
    }
}
