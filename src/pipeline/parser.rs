//! Pipeline Parser
//!
//! Loads and validates pipeline definitions from YAML files.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use log::{debug, info};

use crate::error::PipelineError;

use super::model::Pipeline;

/// Loads a pipeline from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use protorun::pipeline::load_pipeline;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let pipeline = load_pipeline("pipeline.yaml")?;
///     println!("Loaded {} steps", pipeline.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_pipeline<P: AsRef<Path>>(path: P) -> Result<Pipeline, PipelineError> {
    let path = path.as_ref();
    info!("Loading pipeline from: {}", path.display());

    let yaml_content = fs::read_to_string(path).map_err(|e| PipelineError::Read {
        path: path.display().to_string(),
        source: e,
    })?;
    debug!("YAML content loaded ({} bytes)", yaml_content.len());

    parse_pipeline(&yaml_content)
}

/// Parses and validates a pipeline from YAML text.
pub fn parse_pipeline(yaml_content: &str) -> Result<Pipeline, PipelineError> {
    let pipeline: Pipeline = serde_yaml::from_str(yaml_content)?;
    validate_pipeline(&pipeline)?;
    info!("Parsed {} steps", pipeline.steps.len());
    Ok(pipeline)
}

/// Checks ids and programs, and rejects empty pipelines.
pub fn validate_pipeline(pipeline: &Pipeline) -> Result<(), PipelineError> {
    if pipeline.steps.is_empty() {
        return Err(PipelineError::Invalid("pipeline has no steps".to_string()));
    }

    let mut seen = HashSet::new();
    for (i, step) in pipeline.steps.iter().enumerate() {
        if step.id.trim().is_empty() {
            return Err(PipelineError::Invalid(format!("step {} has no id", i + 1)));
        }
        if !seen.insert(step.id.as_str()) {
            return Err(PipelineError::Invalid(format!("duplicate step id '{}'", step.id)));
        }
        if step.program.trim().is_empty() {
            return Err(PipelineError::Invalid(format!(
                "step '{}' has no program",
                step.id
            )));
        }
    }

    for count in [pipeline.threads, pipeline.mpi].into_iter().flatten() {
        if count == 0 {
            return Err(PipelineError::Invalid(
                "thread and process counts must be at least 1".to_string(),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
name: preprocess
threads: 2
steps:
  - id: import
    program: cp
    args: "{input} {output}"
    input: micrographs.txt
    output: imported.txt
  - id: count
    program: wc
    args: "-l {input} > {output}"
    input: imported.txt
    output: count.txt
    interactive: true
"#;

    #[test]
    fn test_parse_sample() {
        let pipeline = parse_pipeline(SAMPLE).unwrap();
        assert_eq!(pipeline.name, "preprocess");
        assert_eq!(pipeline.threads, Some(2));
        assert_eq!(pipeline.mpi, None);
        assert_eq!(pipeline.steps.len(), 2);
        assert!(pipeline.steps[1].interactive);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", SAMPLE).unwrap();

        let pipeline = load_pipeline(file.path()).unwrap();
        assert_eq!(pipeline.steps[0].id, "import");
    }

    #[test]
    fn test_load_missing_file() {
        let result = load_pipeline("/nonexistent/pipeline.yaml");
        assert!(matches!(result, Err(PipelineError::Read { .. })));
    }

    #[test]
    fn test_invalid_yaml() {
        let result = parse_pipeline("steps: [unclosed");
        assert!(matches!(result, Err(PipelineError::Parse(_))));
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        let result = parse_pipeline("name: nothing\n");
        assert!(matches!(result, Err(PipelineError::Invalid(_))));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let yaml = r#"
steps:
  - id: a
    program: echo
  - id: a
    program: "false"
"#;
        let result = parse_pipeline(yaml);
        assert!(matches!(result, Err(PipelineError::Invalid(msg)) if msg.contains("duplicate")));
    }

    #[test]
    fn test_zero_threads_rejected() {
        let yaml = "threads: 0\nsteps:\n  - id: a\n    program: echo\n";
        assert!(matches!(parse_pipeline(yaml), Err(PipelineError::Invalid(_))));
    }
}
