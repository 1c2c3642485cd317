//! Table Export CLI
//!
//! Streams a PostgreSQL table to object storage as rewritten CSV.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use table_export::{build_runtime, io, run_export, Config};

#[derive(Parser)]
#[command(name = "table-export")]
#[command(about = "Export a PostgreSQL table to S3 as CSV", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override the table to export (`table` or `schema.table`)
    #[arg(long, global = true)]
    table: Option<String>,

    /// Compress the export with zstd
    #[arg(long, global = true)]
    compress: bool,

    /// Override the destination: `s3://bucket[/prefix]` or a local directory
    #[arg(long, global = true)]
    output: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the export (default if no command specified)
    Run,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

impl Cli {
    fn load_config(&self) -> Result<Config> {
        let mut config = Config::from_file(&self.config)?;
        self.apply_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides(&self, config: &mut Config) -> Result<()> {
        if let Some(table) = &self.table {
            config.export.table = table.clone();
        }
        if self.compress {
            config.compression.enabled = true;
        }
        if let Some(output) = &self.output {
            if output.starts_with("s3://") {
                let (bucket, prefix) = io::parse_s3_uri(output)?;
                config.output.bucket = Some(bucket.to_string());
                config.output.local_path = None;
                // A bare bucket keeps the configured prefix.
                let prefix = prefix.trim_matches('/');
                if !prefix.is_empty() {
                    config.output.prefix = prefix.to_string();
                }
            } else {
                config.output.local_path = Some(output.clone());
                config.output.bucket = None;
            }
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        None | Some(Commands::Run) => {
            run_command(&cli)?;
        }

        Some(Commands::Validate) => {
            validate_command(&cli)?;
        }

        Some(Commands::GenerateConfig { output }) => {
            generate_config_command(output)?;
        }
    }

    Ok(())
}

fn run_command(cli: &Cli) -> Result<()> {
    let config = cli.load_config()?;

    let runtime = build_runtime(config.processing.worker_threads)?;
    let report = runtime.block_on(run_export(config))?;

    println!("{}", report);
    Ok(())
}

fn validate_command(cli: &Cli) -> Result<()> {
    let config = cli.load_config()?;
    println!("Configuration is valid");
    println!("  table:  {}", config.export.table);
    println!("  output: {}", config.output.path_display());
    Ok(())
}

fn generate_config_command(output: &PathBuf) -> Result<()> {
    std::fs::write(output, SAMPLE_CONFIG)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}

const SAMPLE_CONFIG: &str = r#"# Table Export Configuration

# === DATABASE: Where rows come from ===
database:
  host: "localhost"
  port: 5432
  user: "etl"
  dbname: "warehouse"
  # Falls back to the PGPASSWORD environment variable when omitted
  # password: "secret"
  connect_timeout_secs: 10

# === EXPORT: What to export ===
export:
  # Table name, optionally schema-qualified ("public.large_table")
  table: "large_table"

  # Prepended to every non-empty data cell; the header row is left alone
  marker: "x-"

# === COMPRESSION ===
compression:
  enabled: false

  # Zstd compression level (0-22, higher = smaller but slower)
  level: 3

# === OUTPUT: Where the CSV object is written ===
# Choose ONE of: local_path (local disk) OR bucket (S3)
output:
  # Option 1: Write to local filesystem
  # local_path: "/tmp/table-export"

  # Option 2: Write to S3
  bucket: "large-table-etl-demo"

  # Key prefix; objects are named <prefix>/<table>_<timestamp>.csv[.zst]
  prefix: "exports"

# === PROCESSING: Performance tuning ===
processing:
  # Frames buffered between adjacent pipeline stages
  channel_capacity: 16

  # Bytes of rewritten CSV accumulated before it is sent downstream
  flush_bytes: 65536

  # Multipart upload part size in MiB (S3 minimum is 5)
  upload_part_size_mb: 10

  # Multipart parts uploaded concurrently
  upload_concurrency: 8

  # Tokio async worker threads (null = num CPUs)
  # worker_threads: 4

  # Print throughput metrics during the export
  enable_metrics: true

  # Metrics reporting interval in seconds
  metrics_interval_secs: 10

  # Save final metrics as JSON
  # metrics_output_path: "metrics.json"

# === AWS: S3 connection settings ===
aws:
  region: "us-east-1"

  # Custom S3 endpoint (for LocalStack, MinIO, etc.)
  # endpoint_url: "http://localhost:4566"
  # allow_http: true
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_default() {
        // No subcommand - should default to Run
        let cli = Cli::try_parse_from(["table-export"]);
        assert!(cli.is_ok());
        assert!(cli.unwrap().command.is_none());
    }

    #[test]
    fn test_cli_parse_with_config() {
        let cli = Cli::try_parse_from(["table-export", "-c", "other.yaml"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("other.yaml"));
    }

    #[test]
    fn test_cli_parse_validate() {
        let cli = Cli::try_parse_from(["table-export", "validate", "-c", "test.json"]);
        assert!(matches!(cli.unwrap().command, Some(Commands::Validate)));
    }

    #[test]
    fn test_sample_config_is_valid() {
        let config = Config::from_yaml(SAMPLE_CONFIG).unwrap();
        config.validate().unwrap();
        assert_eq!(config.export.table, "large_table");
    }

    #[test]
    fn test_overrides() {
        let cli = Cli::try_parse_from([
            "table-export",
            "--table",
            "public.orders",
            "--compress",
            "--output",
            "s3://other-bucket/daily/",
        ])
        .unwrap();

        let mut config = Config::from_yaml(SAMPLE_CONFIG).unwrap();
        cli.apply_overrides(&mut config).unwrap();
        assert_eq!(config.export.table, "public.orders");
        assert!(config.compression.enabled);
        assert_eq!(config.output.bucket.as_deref(), Some("other-bucket"));
        assert_eq!(config.output.prefix, "daily");
        config.validate().unwrap();
    }

    #[test]
    fn test_bucket_only_output_override() {
        let cli = Cli::try_parse_from(["table-export", "--output", "s3://other-bucket"]).unwrap();
        let mut config = Config::from_yaml(SAMPLE_CONFIG).unwrap();
        cli.apply_overrides(&mut config).unwrap();
        assert_eq!(config.output.bucket.as_deref(), Some("other-bucket"));
        assert_eq!(config.output.prefix, "exports");
        config.validate().unwrap();
    }

    #[test]
    fn test_local_output_override() {
        let cli = Cli::try_parse_from(["table-export", "--output", "/tmp/out"]).unwrap();
        let mut config = Config::from_yaml(SAMPLE_CONFIG).unwrap();
        cli.apply_overrides(&mut config).unwrap();
        assert_eq!(config.output.local_path.as_deref(), Some("/tmp/out"));
        assert!(config.output.bucket.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_generate_config_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        generate_config_command(&path).unwrap();
        let config = Config::from_file(&path).unwrap();
        assert!(config.validate().is_ok());
    }
}
