//! Load-time workflow validation and storage, with optional hot-reload.
//!
//! A workflow document may declare a single workflow at its top level or a
//! `workflows:` map of several. Cycle/unknown-dependency checks are
//! kept (via [`WorkflowSpec::validate`]) while its reordering output is not:
//! DAEL always executes a workflow's steps in declaration order.

use std::collections::HashMap;
use std::sync::RwLock;

use dael_types::{DaelError, ErrorCode, WorkflowBundle, WorkflowSpec};

/// Parses a workflow document: either `{name, version, steps, ...}` at the
/// top level, or `{workflows: {name: {...}, ...}}`.
pub fn parse_workflow_document(source: &str) -> Result<HashMap<String, WorkflowSpec>, DaelError> {
    if let Ok(bundle) = serde_yaml::from_str::<WorkflowBundle>(source) {
        if !bundle.workflows.is_empty() {
            for spec in bundle.workflows.values() {
                spec.validate()?;
            }
            return Ok(bundle.workflows);
        }
    }
    let spec: WorkflowSpec = serde_yaml::from_str(source)
        .map_err(|e| DaelError::new(ErrorCode::ConfigInvalid, format!("failed to parse workflow document: {e}")))?;
    spec.validate()?;
    let mut map = HashMap::new();
    map.insert(spec.name.clone(), spec);
    Ok(map)
}

/// An in-memory, atomically-replaceable set of known workflows.
///
/// `refresh` swaps the whole snapshot only after every workflow in the new
/// document passes validation — a partially-bad reload never replaces a
/// good running snapshot.
pub struct WorkflowRegistry {
    workflows: RwLock<HashMap<String, WorkflowSpec>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_source(source: &str) -> Result<Self, DaelError> {
        let workflows = parse_workflow_document(source)?;
        Ok(Self {
            workflows: RwLock::new(workflows),
        })
    }

    /// Builds a registry directly from already-constructed specs, validating
    /// each. Useful for embedding a fixed set of workflows without a YAML
    /// round trip (tests, and callers that build specs programmatically).
    pub fn from_specs(workflows: HashMap<String, WorkflowSpec>) -> Result<Self, DaelError> {
        for spec in workflows.values() {
            spec.validate()?;
        }
        Ok(Self {
            workflows: RwLock::new(workflows),
        })
    }

    /// Replaces the registry's contents with the workflows parsed from
    /// `source`, only after all of them validate successfully.
    pub fn refresh(&self, source: &str) -> Result<(), DaelError> {
        let workflows = parse_workflow_document(source)?;
        *self.workflows.write().expect("workflow registry lock poisoned") = workflows;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<WorkflowSpec> {
        self.workflows.read().expect("workflow registry lock poisoned").get(name).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .workflows
            .read()
            .expect("workflow registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SINGLE: &str = r#"
name: demo
version: "1.0.0"
steps:
  - id: a
    tool:
      name: noop
      params: {}
"#;

    const MULTI: &str = r#"
workflows:
  demo-a:
    name: demo-a
    version: "1.0.0"
    steps:
      - id: a
        tool:
          name: noop
          params: {}
  demo-b:
    name: demo-b
    version: "1.0.0"
    steps:
      - id: a
        tool:
          name: noop
          params: {}
"#;

    #[test]
    fn parses_single_top_level_workflow() {
        let workflows = parse_workflow_document(SINGLE).unwrap();
        assert_eq!(workflows.len(), 1);
        assert!(workflows.contains_key("demo"));
    }

    #[test]
    fn parses_multi_workflow_bundle() {
        let workflows = parse_workflow_document(MULTI).unwrap();
        assert_eq!(workflows.len(), 2);
        assert!(workflows.contains_key("demo-a"));
        assert!(workflows.contains_key("demo-b"));
    }

    #[test]
    fn refresh_replaces_snapshot_only_on_full_success() {
        let registry = WorkflowRegistry::from_source(SINGLE).unwrap();
        assert_eq!(registry.list(), vec!["demo".to_string()]);

        let bad = "name: 123\nversion: \"x\"\nsteps: []";
        assert!(registry.refresh(bad).is_err());
        assert_eq!(registry.list(), vec!["demo".to_string()]);

        registry.refresh(MULTI).unwrap();
        assert_eq!(registry.list(), vec!["demo-a".to_string(), "demo-b".to_string()]);
    }

    #[test]
    fn rejects_workflow_with_forward_dependency_at_load_time() {
        let bad = r#"
name: demo
version: "1.0.0"
steps:
  - id: a
    depends_on: ["b"]
    tool:
      name: noop
      params: {}
  - id: b
    tool:
      name: noop
      params: {}
"#;
        let error = parse_workflow_document(bad).unwrap_err();
        assert_eq!(error.code, ErrorCode::CircularDependency);
    }
}
