//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use crate::models::{Technique, ThreatLevel};
use clap::Parser;
use std::path::PathBuf;

/// SampleGate - concurrent multi-technique malware sample analysis
///
/// Runs static, signature, sandbox, module and AI ensemble analysis over
/// samples under per-technique bulkheads. Markdown/JSON reports.
///
/// Examples:
///   samplegate ./samples
///   samplegate invoice.exe --techniques static,signature
///   samplegate ./samples --ollama-url http://localhost:11434 --model llama3.2:latest --model qwen2.5:7b
///   samplegate ./samples --container sandbox-win10 --fail-on malicious
///   samplegate --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Sample files or directories to analyze
    #[arg(value_name = "PATH", required_unless_present = "init_config")]
    pub paths: Vec<PathBuf>,

    /// Output file path for the report
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Path to configuration file
    ///
    /// If not specified, looks for .samplegate.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output, no progress bars)
    #[arg(short, long)]
    pub quiet: bool,

    /// Output format (markdown, json)
    #[arg(long, default_value = "markdown", value_name = "FORMAT")]
    pub format: OutputFormat,

    /// Techniques to apply (comma-separated)
    ///
    /// Example: --techniques static,signature,ai
    #[arg(long, value_name = "LIST", value_delimiter = ',')]
    pub techniques: Option<Vec<Technique>>,

    /// Ollama API endpoint; replaces the configured providers
    #[arg(long, value_name = "URL", env = "OLLAMA_URL")]
    pub ollama_url: Option<String>,

    /// Model to query through --ollama-url (repeat for an ensemble)
    #[arg(long = "model", value_name = "MODEL")]
    pub models: Vec<String>,

    /// Providers that must answer before a consensus is formed
    #[arg(long, value_name = "COUNT")]
    pub required_providers: Option<usize>,

    /// Sandbox container for dynamic analysis
    #[arg(long, value_name = "NAME")]
    pub container: Option<String>,

    /// Memory budget for modules and analysis buffers, in MiB
    #[arg(long, value_name = "MIB")]
    pub memory_limit_mb: Option<u64>,

    /// Fail if any sample reaches this threat level
    ///
    /// Useful for CI pipelines. Exit code 2 when the threshold is reached.
    /// Values: safe, suspicious, malicious, critical
    #[arg(long, value_name = "LEVEL")]
    pub fail_on: Option<ThreatLevel>,

    /// Dry run: list the samples that would be analyzed and exit
    #[arg(long)]
    pub dry_run: bool,

    /// Generate a default .samplegate.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

/// Output format for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

impl OutputFormat {
    pub fn default_file_name(&self) -> &'static str {
        match self {
            OutputFormat::Markdown => "samplegate_report.md",
            OutputFormat::Json => "samplegate_report.json",
        }
    }
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        if self.init_config {
            return Ok(());
        }

        if self.paths.is_empty() {
            return Err("At least one sample path is required".to_string());
        }

        if let Some(ref url) = self.ollama_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err("Ollama URL must start with 'http://' or 'https://'".to_string());
            }
        }

        if !self.models.is_empty() && self.ollama_url.is_none() {
            return Err("--model requires --ollama-url".to_string());
        }

        if self.required_providers == Some(0) {
            return Err("Required providers must be at least 1".to_string());
        }

        if self.memory_limit_mb == Some(0) {
            return Err("Memory limit must be at least 1 MiB".to_string());
        }

        if let Some(ref techniques) = self.techniques {
            if techniques.is_empty() {
                return Err("At least one technique is required".to_string());
            }
        }

        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
