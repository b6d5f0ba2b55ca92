//! Batch processing of pre-configured queries.
//!
//! A TOML job file lists the queries to reason about, each with an optional
//! context and level. Results are summarized on stdout and optionally saved
//! as JSON.

use crate::{
    orchestrator::{BatchItem, Orchestrator},
    settings::Settings,
    types::{ComplexityLevel, Context, ReasoningOptions},
};
use anyhow::{anyhow, Context as _, Result};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, path::Path, path::PathBuf, time::Instant};
use tracing::{error, info, instrument, warn};

/// Batch job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub job: JobMetadata,
    pub queries: Vec<QueryConfig>,
    #[serde(default)]
    pub settings: BatchSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetadata {
    pub name: String,
    pub description: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Unique query identifier
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub context: Context,
    /// Forces the complexity level for this query.
    pub level: Option<ComplexityLevel>,
    pub task_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    /// Overrides `orchestrator.max_concurrent_cycles` for this job only.
    pub max_concurrent_queries: Option<usize>,
    /// Output file for results
    pub output_file: Option<PathBuf>,
    /// Minimum success rate for the job to count as successful.
    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: f64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_concurrent_queries: None,
            output_file: None,
            min_success_rate: default_min_success_rate(),
        }
    }
}

/// Result of a single query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub id: String,
    pub success: bool,
    pub confidence: f64,
    pub level: Option<ComplexityLevel>,
    pub components_used: usize,
    pub response: String,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Success,
    PartialSuccess,
    Failed,
}

/// Complete batch execution result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub job_name: String,
    pub status: BatchStatus,
    pub total_queries: usize,
    pub successful_queries: usize,
    pub failed_queries: usize,
    pub success_rate: f64,
    pub total_duration_ms: u64,
    pub results: Vec<QueryResult>,
}

/// Execute a batch job from configuration file
#[instrument(skip(settings))]
pub async fn run(config_path: PathBuf, settings: Settings) -> Result<()> {
    info!("Starting batch execution from config: {:?}", config_path);

    let config = load_batch_config(&config_path).context("Failed to load batch configuration")?;
    info!("Loaded batch job: {} (version: {})", config.job.name, config.job.version);

    let orchestrator = Orchestrator::new(settings).context("Failed to initialize engine")?;
    let output_file = config.settings.output_file.clone();
    let result = execute_batch(&orchestrator, config).await?;

    print_batch_summary(&result);
    if let Some(path) = &output_file {
        save_batch_results(&result, path).context("Failed to save batch results")?;
    }

    match result.status {
        BatchStatus::Success => Ok(()),
        BatchStatus::PartialSuccess => {
            warn!("Batch completed with some failures");
            Ok(())
        }
        BatchStatus::Failed => {
            error!("Batch execution failed");
            Err(anyhow!(
                "Batch success rate {:.2} is below the required minimum",
                result.success_rate
            ))
        }
    }
}

/// Load batch configuration from TOML file
pub fn load_batch_config(config_path: &Path) -> Result<BatchConfig> {
    let contents = std::fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

    let config: BatchConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse TOML config: {:?}", config_path))?;

    validate_batch_config(&config)?;
    Ok(config)
}

fn validate_batch_config(config: &BatchConfig) -> Result<()> {
    if config.queries.is_empty() {
        return Err(anyhow!("Batch configuration must contain at least one query"));
    }

    let mut ids = HashSet::new();
    for query in &config.queries {
        if !ids.insert(&query.id) {
            return Err(anyhow!("Duplicate query ID: {}", query.id));
        }
    }

    if config.settings.max_concurrent_queries == Some(0) {
        return Err(anyhow!("max_concurrent_queries cannot be 0"));
    }
    if !(0.0..=1.0).contains(&config.settings.min_success_rate) {
        return Err(anyhow!("min_success_rate must be within [0, 1]"));
    }
    Ok(())
}

/// Runs every query of `config` through `orchestrator`.
pub async fn execute_batch(orchestrator: &Orchestrator, config: BatchConfig) -> Result<BatchResult> {
    let start_time = Instant::now();

    let ids: Vec<String> = config.queries.iter().map(|q| q.id.clone()).collect();
    let items = config
        .queries
        .into_iter()
        .map(|q| BatchItem {
            query: q.text,
            context: q.context,
            options: ReasoningOptions {
                task_type: q.task_type,
                complexity_preference: q.level,
            },
        })
        .collect();

    let report = orchestrator
        .run_batch(items, config.settings.max_concurrent_queries)
        .await;
    let results: Vec<QueryResult> = ids
        .into_iter()
        .zip(report.responses)
        .map(|(id, response)| QueryResult {
            id,
            success: response.success,
            confidence: response.confidence,
            level: response.level(),
            components_used: response.components_used,
            error: response.diagnostics.failure_reason.clone(),
            duration_ms: (response.processing_time * 1_000.0) as u64,
            response: response.response,
        })
        .collect();

    let successful_queries = results.iter().filter(|r| r.success).count();
    let failed_queries = results.len() - successful_queries;
    let status = if failed_queries == 0 {
        BatchStatus::Success
    } else if report.success_rate >= config.settings.min_success_rate && successful_queries > 0 {
        BatchStatus::PartialSuccess
    } else {
        BatchStatus::Failed
    };

    Ok(BatchResult {
        job_name: config.job.name,
        status,
        total_queries: results.len(),
        successful_queries,
        failed_queries,
        success_rate: report.success_rate,
        total_duration_ms: start_time.elapsed().as_millis() as u64,
        results,
    })
}

/// Print batch execution summary
fn print_batch_summary(result: &BatchResult) {
    println!("\n=== Batch Execution Summary ===");
    println!("Job: {}", result.job_name);
    println!("Status: {:?}", result.status);
    println!("Total Queries: {}", result.total_queries);
    println!("Successful: {}", result.successful_queries);
    println!("Failed: {}", result.failed_queries);
    println!("Success Rate: {:.1}%", result.success_rate * 100.0);
    println!("Duration: {}ms", result.total_duration_ms);

    if result.failed_queries > 0 {
        println!("\nFailed Queries:");
        for query in result.results.iter().filter(|r| !r.success) {
            println!(
                "  - {}: {}",
                query.id,
                query.error.as_deref().unwrap_or("Unknown error")
            );
        }
    }
    println!("===============================\n");
}

/// Save batch results to JSON file
fn save_batch_results(result: &BatchResult, output_file: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(result).context("Failed to serialize batch results")?;
    std::fs::write(output_file, json)
        .with_context(|| format!("Failed to write results to: {:?}", output_file))?;
    info!("Batch results saved to: {:?}", output_file);
    Ok(())
}

fn default_version() -> String {
    "1.0".to_string()
}
fn default_min_success_rate() -> f64 {
    0.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const JOB: &str = r#"
[job]
name = "physics_questions"
description = "Smoke test"

[settings]
max_concurrent_queries = 2

[[queries]]
id = "boiling"
text = "Why does altitude change the boiling point of water?"
level = "organ"

[[queries]]
id = "poem"
text = "the moon is a silver coin"
context = { domain = "poetry" }

[[queries]]
id = "blank"
text = "  "
"#;

    #[test]
    fn rejects_duplicate_ids() {
        let mut config: BatchConfig = toml::from_str(JOB).unwrap();
        let first = config.queries[0].clone();
        config.queries.push(first);
        assert!(validate_batch_config(&config).is_err());
    }

    #[test]
    fn loads_job_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("job.toml");
        fs::write(&path, JOB).unwrap();

        let config = load_batch_config(&path).unwrap();
        assert_eq!(config.job.name, "physics_questions");
        assert_eq!(config.job.version, "1.0");
        assert_eq!(config.queries.len(), 3);
        assert_eq!(config.queries[0].level, Some(ComplexityLevel::Organ));
        assert_eq!(config.queries[1].context["domain"], "poetry");
        assert_eq!(config.settings.max_concurrent_queries, Some(2));
    }

    #[tokio::test]
    async fn executes_and_saves_results() {
        let config: BatchConfig = toml::from_str(JOB).unwrap();
        let orchestrator = Orchestrator::new(Settings::default()).unwrap();
        let result = execute_batch(&orchestrator, config).await.unwrap();

        assert_eq!(result.total_queries, 3);
        assert_eq!(result.results[0].id, "boiling");
        assert_eq!(result.results[0].level, Some(ComplexityLevel::Organ));
        assert!(result.results.iter().all(|r| r.success));
        assert_eq!(result.status, BatchStatus::Success);
        // The job's concurrency limit does not leak into the engine settings.
        assert_eq!(orchestrator.settings().orchestrator.max_concurrent_cycles, 4);
        assert!(!orchestrator.get_status().await.pending_configuration);

        let dir = tempdir().unwrap();
        let path = dir.path().join("results.json");
        save_batch_results(&result, &path).unwrap();
        let saved: BatchResult = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved.total_queries, 3);
    }
}
