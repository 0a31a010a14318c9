//! Build automation tasks for rawload
//!
//! Currently generates the CLI reference from the clap definitions.

use clap::Parser;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build automation tasks for rawload", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser)]
enum Command {
    /// Generate the CLI reference in markdown
    GenerateCliDocs {
        /// Output directory for generated documentation
        #[arg(short, long, default_value = "docs")]
        output_dir: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::GenerateCliDocs { output_dir } => generate_cli_docs(&output_dir)?,
    }

    Ok(())
}

fn generate_cli_docs(output_dir: &str) -> anyhow::Result<()> {
    println!("Generating CLI documentation...");

    let markdown = clap_markdown::help_markdown::<rawload::cli::Cli>();

    let content = format!(
        r#"# rawload CLI Reference

This documentation is generated from the CLI source code. Last updated: {}.

## Overview

`rawload` loads the raw Olist CSV datasets from an S3-compatible bucket into
PostgreSQL tables (`<dataset>_raw`), parents before children. A dataset whose
destination row count already matches its source is skipped; any other
dataset is replaced inside a single transaction.

## Usage

```bash
# Load everything, creating the tables on first run
rawload

# Rebuild the managed schema from scratch, then load
rawload --force-schema-recreate

# Verify credentials and reachability without loading
rawload --check-connections

# Machine-readable run summary
rawload --summary-format json
```

Exit codes: `0` completed, `1` failed, `130` cancelled.

{}

## Environment Variables

| Variable | Default | Description |
|----------|---------|-------------|
| `DATABASE_URL` | | Full connection URL; replaces the `DB_*` parameters |
| `DB_HOST`, `DB_NAME`, `DB_USER`, `DB_PASSWORD` | | Connection parameters |
| `DB_PORT` | `5432` | |
| `DB_SSLMODE` | `require` | `disable`, `prefer`, `require`, `verify-ca`, `verify-full` |
| `DB_SCHEMA` | `public` | Schema holding the managed tables |
| `DB_MAX_CONNECTIONS` | `2` | |
| `DB_CONNECT_TIMEOUT` | `30` | Seconds |
| `DB_STATEMENT_TIMEOUT` | `300` | Seconds |
| `S3_BUCKET`, `S3_REGION` | | Required |
| `S3_ACCESS_KEY` / `AWS_ACCESS_KEY_ID` | | Required |
| `S3_SECRET_KEY` / `AWS_SECRET_ACCESS_KEY` | | Required |
| `S3_PREFIX` | `raw/` | |
| `S3_ENDPOINT` | | Custom endpoint (MinIO, ...) |
| `S3_PATH_STYLE` | `false` | |
| `S3_TIMEOUT_SECS` | `600` | |
| `LOADER_BATCH_SIZE` | `1000` | Rows per insert statement |
| `LOADER_FAILURE_POLICY` | `fail_fast` | or `continue_independent` |
| `LOADER_TEMP_DIR` | system temp | Where source objects are staged |
| `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT`, `LOG_DIR`, `LOG_FILE_PREFIX`, `LOG_FILTER` | | Logging |

---

*To update, run `cargo xtask generate-cli-docs`.*
"#,
        chrono::Utc::now().format("%Y-%m-%d"),
        markdown
    );

    let output_path = PathBuf::from(output_dir);
    fs::create_dir_all(&output_path)?;

    let file_path = output_path.join("cli.md");
    fs::write(&file_path, content)?;

    println!("Generated CLI documentation at: {}", file_path.display());

    Ok(())
}
