//! SampleGate - concurrent multi-technique malware sample analysis
//!
//! Scans sample paths, feeds the files to the analysis coordinator a
//! bounded window at a time, which runs each enabled technique under its own
//! bulkhead, and writes a Markdown or JSON report once every file has
//! finished.
//!
//! Exit codes:
//!   0 - Success (no sample at or above the --fail-on level, or no --fail-on set)
//!   1 - Runtime error (config, unreadable paths, report IO, etc.)
//!   2 - A sample reached the --fail-on threat level

mod cache;
mod cli;
mod config;
mod consensus;
mod error;
mod memory;
mod models;
mod providers;
mod report;
mod scanner;
mod scheduler;
mod techniques;

use anyhow::{Context, Result};
use cache::VerdictCache;
use chrono::Utc;
use cli::{Args, OutputFormat};
use config::Config;
use consensus::ConsensusEngine;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use memory::{MemoryAllocator, PressureLevel};
use models::{AnalysisFile, Report, ReportMetadata, Technique};
use parking_lot::Mutex;
use providers::{CircuitBreaker, DockerSandbox, OllamaProvider, ProcessModuleRunner};
use scanner::{SampleScanner, ScanConfig, ScannedSample};
use scheduler::{
    analyze_all, intake_window, AnalysisCoordinator, AnalyzerRegistry, ProgressEvent,
    ProgressReporter,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use techniques::{AiAnalyzer, DynamicAnalyzer, ModuleAnalyzer, SignatureAnalyzer, StaticAnalyzer};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();

    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    init_logging(&args);

    info!("SampleGate v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match run_analysis(args).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Analysis failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .samplegate.toml.
fn handle_init_config() -> Result<()> {
    let path = std::path::Path::new(config::CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            config::CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", config::CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", config::CONFIG_FILE);
    println!("   Edit it to add AI providers, a sandbox container, modules and signature rules.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args) {
    let level = args.log_level();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Run the complete analysis workflow. Returns exit code (0 or 2).
async fn run_analysis(args: Args) -> Result<i32> {
    let start_time = Instant::now();

    let mut config = load_config(&args)?;
    config.merge_with_args(&args);
    config.validate()?;

    // Step 1: Find the samples
    let samples = SampleScanner::new(ScanConfig::from(&config.general)).scan(&args.paths)?;

    if args.dry_run {
        return Ok(handle_dry_run(&samples));
    }
    if samples.is_empty() {
        println!("No samples found.");
        return Ok(0);
    }

    // Step 2: Build the services
    let shutdown = CancellationToken::new();
    let memory = Arc::new(MemoryAllocator::new(config.memory.clone()));
    let sweeper = memory.spawn_sweeper(shutdown.clone());
    let last_pressure = Mutex::new(PressureLevel::Low);
    let pressure_watch = memory.on_pressure_change(move |stats| {
        let mut last = last_pressure.lock();
        if stats.pressure != *last {
            if stats.pressure >= PressureLevel::High {
                warn!(
                    "Memory pressure {} ({} of {} bytes)",
                    stats.pressure, stats.total_allocated, stats.total_limit
                );
            } else {
                debug!("Memory pressure {}", stats.pressure);
            }
            *last = stats.pressure;
        }
    });

    let registry = build_registry(&config, &memory)?;
    debug!("Registered analyzers: {:?}", registry.techniques());
    let techniques = enabled_techniques(&config.general.techniques, &registry);
    if techniques.is_empty() {
        anyhow::bail!("None of the requested techniques is available");
    }
    if techniques.contains(&Technique::Ai)
        && config.providers.len() < config.consensus.required_providers
    {
        warn!(
            "AI consensus needs {} providers but only {} are configured; AI tasks will fail",
            config.consensus.required_providers,
            config.providers.len()
        );
    }

    let (progress, events) = ProgressReporter::channel(config.general.progress_buffer);
    let coordinator = AnalysisCoordinator::new(
        &config.bulkheads,
        techniques.clone(),
        registry,
        Arc::clone(&memory),
        progress,
    );

    println!("🔬 Analyzing {} samples", samples.len());
    let names: Vec<&str> = techniques.iter().map(|t| t.as_str()).collect();
    println!("   Techniques: {}", names.join(", "));
    if !config.providers.is_empty() {
        let models: Vec<&str> = config.providers.iter().map(|p| p.model.as_str()).collect();
        println!("   AI providers: {}", models.join(", "));
    }

    // Step 3: Hash the samples
    let mut files = Vec::with_capacity(samples.len());
    for sample in &samples {
        match AnalysisFile::from_path(&sample.path).await {
            Ok(file) => files.push(file),
            Err(e) => warn!("{:#}", e),
        }
    }

    let labels = files
        .iter()
        .map(|f| (f.id.clone(), f.name.clone()))
        .collect();
    let renderer = spawn_progress_renderer(events, labels, args.quiet, shutdown.clone());

    // Ctrl-C cancels every registered file; files not yet submitted are
    // cancelled as soon as the intake reaches them.
    let stop = CancellationToken::new();
    let interrupt = {
        let coordinator = coordinator.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling in-flight analyses");
                stop.cancel();
                coordinator.shutdown();
            }
        })
    };

    // Step 4: Submit within the intake window and collect each file's tasks
    let window = intake_window(&config.bulkheads, &techniques);
    debug!("Intake window: {} files", window);
    let file_reports = analyze_all(&coordinator, files, window, &stop)
        .await
        .context("Failed to submit samples")?;

    let resource_usage = coordinator.resource_usage();
    interrupt.abort();
    coordinator.shutdown();
    memory.unsubscribe(pressure_watch);
    shutdown.cancel();
    if let Err(e) = renderer.await {
        debug!("Progress renderer ended abnormally: {}", e);
    }
    if let Err(e) = sweeper.await {
        debug!("Memory sweeper ended abnormally: {}", e);
    }

    // Step 5: Build and save the report
    let duration = start_time.elapsed().as_secs_f64();
    let report = Report {
        metadata: ReportMetadata {
            analysis_date: Utc::now(),
            techniques,
            providers: config.providers.iter().map(|p| p.name.clone()).collect(),
            files_analyzed: file_reports.len(),
            files_degraded: file_reports.iter().filter(|f| f.failed_tasks() > 0).count(),
            duration_seconds: duration,
        },
        files: file_reports,
        resource_usage,
    };

    let output = match args.format {
        OutputFormat::Json => report::generate_json_report(&report)?,
        OutputFormat::Markdown => report::generate_markdown_report(&report),
    };
    let output_path = args
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&config, args.format));
    report::write_report(&output, &output_path)?;

    print_summary(&report);
    println!(
        "\n✅ Analysis complete! Report saved to: {}",
        output_path.display()
    );

    // Check --fail-on threshold
    if let Some(level) = args.fail_on {
        if report.reaches(level) {
            eprintln!(
                "\n⛔ Samples found at or above {} threat level. Failing (exit code 2).",
                level
            );
            return Ok(2);
        }
    }

    Ok(0)
}

/// Register an analyzer for every technique the configuration can support.
fn build_registry(config: &Config, memory: &Arc<MemoryAllocator>) -> Result<AnalyzerRegistry> {
    let mut registry = AnalyzerRegistry::new();

    registry.register(StaticAnalyzer::new());
    registry.register(SignatureAnalyzer::new(&config.signature.rules)?);

    if let Some(ref container) = config.sandbox.container {
        registry.register(DynamicAnalyzer::new(
            Arc::new(DockerSandbox::default()),
            container.clone(),
            config.sandbox.command.clone(),
            config.sandbox.sample_dir.clone(),
            config.sandbox.timeout_secs,
        ));
    }

    if let Some(ref runner) = config.module.runner {
        if !config.module.modules.is_empty() {
            let invoker = ProcessModuleRunner::from_command_line(runner)?;
            registry.register(ModuleAnalyzer::new(
                Arc::new(invoker),
                config.module.modules.clone(),
            ));
        }
    }

    if !config.providers.is_empty() {
        let cache = VerdictCache::new(
            Arc::clone(memory),
            Duration::from_secs(config.memory.cache_max_age_secs),
        );
        let mut ai = AiAnalyzer::new(ConsensusEngine::new(config.consensus.clone()))
            .with_cache(cache);
        for provider in &config.providers {
            let breaker = CircuitBreaker::new(
                &provider.name,
                provider.failure_threshold,
                provider.success_threshold,
                Duration::from_secs(provider.open_secs),
            );
            let client = OllamaProvider::new(provider.clone())
                .with_context(|| format!("Failed to create provider {}", provider.name))?;
            ai = ai.with_provider(Arc::new(client), breaker);
        }
        registry.register(ai);
    }

    Ok(registry)
}

/// Keep the requested techniques that have an analyzer, in request order.
fn enabled_techniques(requested: &[Technique], registry: &AnalyzerRegistry) -> Vec<Technique> {
    let mut enabled = Vec::new();
    for technique in requested {
        if enabled.contains(technique) {
            continue;
        }
        if registry.contains(*technique) {
            enabled.push(*technique);
        } else {
            warn!(
                "Skipping {} analysis: not configured (see {})",
                technique,
                config::CONFIG_FILE
            );
        }
    }
    enabled
}

fn default_output_path(config: &Config, format: OutputFormat) -> PathBuf {
    let configured = PathBuf::from(&config.general.output);
    match format {
        OutputFormat::Markdown => configured,
        OutputFormat::Json if configured.extension().is_some_and(|e| e == "md") => {
            configured.with_extension("json")
        }
        OutputFormat::Json => PathBuf::from(format.default_file_name()),
    }
}

/// Drain progress events into one bar per task until `stop` fires.
fn spawn_progress_renderer(
    mut events: mpsc::Receiver<ProgressEvent>,
    labels: HashMap<String, String>,
    quiet: bool,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let multi = MultiProgress::new();
        let style = ProgressStyle::default_bar()
            .template("{prefix:>24.bold} [{bar:30.cyan/blue}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        let mut bars: HashMap<(String, Technique), ProgressBar> = HashMap::new();

        loop {
            let event = tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = stop.cancelled() => break,
            };
            if quiet {
                continue;
            }

            let bar = bars
                .entry((event.file_id.clone(), event.technique))
                .or_insert_with(|| {
                    let name = labels
                        .get(&event.file_id)
                        .map(String::as_str)
                        .unwrap_or("sample");
                    let bar = multi.add(ProgressBar::new(100));
                    bar.set_style(style.clone());
                    bar.set_prefix(format!("{} {}", name, event.technique));
                    bar
                });

            bar.set_position(u64::from(event.progress));
            if event.phase.is_terminal() {
                bar.finish_with_message(format!("{:?}", event.phase).to_lowercase());
            } else {
                bar.set_message(event.message);
            }
        }

        if let Err(e) = multi.clear() {
            debug!("Failed to clear progress bars: {}", e);
        }
    })
}

/// Handle --dry-run: print the samples that would be analyzed.
fn handle_dry_run(samples: &[ScannedSample]) -> i32 {
    println!("\n🔍 Dry run: scanning samples (no analysis)...\n");

    if samples.is_empty() {
        println!("   No samples found.");
    } else {
        println!("   Found {} samples that would be analyzed:\n", samples.len());
        for sample in samples {
            println!("     📄 {} ({} bytes)", sample.path.display(), sample.size);
        }
        println!("\n   Total: {} samples", samples.len());
    }

    println!("\n✅ Dry run complete. Nothing was executed.");
    0
}

fn print_summary(report: &Report) {
    println!("\n📊 Analysis Summary:");
    println!("   Samples: {}", report.metadata.files_analyzed);
    let counts: Vec<String> = report
        .verdict_counts()
        .into_iter()
        .map(|(level, count)| format!("{} {}: {}", level.emoji(), level, count))
        .collect();
    println!("   {}", counts.join(" | "));
    if report.metadata.files_degraded > 0 {
        println!(
            "   ⚠️  {} samples had failed tasks",
            report.metadata.files_degraded
        );
    }
    println!("   Duration: {:.1}s", report.metadata.duration_seconds);
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => {
            info!("Loaded default config from {}", config::CONFIG_FILE);
            Ok(config)
        }
        Ok(None) => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            warn!("Failed to load config: {}", e);
            Ok(Config::default())
        }
    }
}
