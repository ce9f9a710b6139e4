//! Plan loading/saving and workflow package export/import.
//!
//! `load_plan_from_file` is a plain `fs::read_to_string` +
//! `serde_json::from_str`, wrapped in `anyhow::Context`; package
//! export/import wraps a Plan in a manifest (name, author, timestamp,
//! schema version) using the same fs+serde_json pattern.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::Plan;
use crate::errors::LoaderError;

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

pub fn load_plan_from_file<P: AsRef<Path>>(path: P) -> Result<Plan> {
    let content = fs::read_to_string(path).context("failed to read plan file")?;
    let plan = serde_json::from_str(&content).context("failed to parse plan JSON")?;
    Ok(plan)
}

pub fn save_plan_to_file<P: AsRef<Path>>(plan: &Plan, path: P) -> Result<()> {
    let json = serde_json::to_string_pretty(plan)?;
    fs::write(path, json).context("failed to write plan file")?;
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageManifest {
    pub name: String,
    pub author: Option<String>,
    pub created_at: DateTime<Utc>,
    pub schema_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowPackage {
    pub manifest: PackageManifest,
    pub plan: Plan,
}

/// Exports `plan` as a workflow package to `path`.
pub fn export_package(plan: &Plan, name: &str, author: Option<String>, path: impl AsRef<Path>) -> Result<()> {
    let package = WorkflowPackage {
        manifest: PackageManifest {
            name: name.to_string(),
            author,
            created_at: Utc::now(),
            schema_version: CURRENT_SCHEMA_VERSION,
        },
        plan: plan.clone(),
    };
    let json = serde_json::to_string_pretty(&package)?;
    fs::write(path, json).context("failed to write workflow package")?;
    Ok(())
}

/// Imports a workflow package, rejecting anything newer than
/// `CURRENT_SCHEMA_VERSION` with `SchemaTooNew`.
pub fn import_package(path: impl AsRef<Path>) -> Result<WorkflowPackage> {
    let content = fs::read_to_string(path).context("failed to read workflow package")?;
    let package: WorkflowPackage = serde_json::from_str(&content).context("failed to parse workflow package")?;
    if package.manifest.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(LoaderError::SchemaTooNew {
            found: package.manifest.schema_version,
            supported: CURRENT_SCHEMA_VERSION,
        }
        .into());
    }
    Ok(package)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SourceContextSnapshot;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn sample_plan() -> Plan {
        Plan {
            id: "p1".into(),
            name: "sample".into(),
            description: None,
            source_request: "do thing".into(),
            steps: HashMap::new(),
            dependencies: HashMap::new(),
            data_flow: vec![],
            entry_points: vec![],
            initial_variables: HashMap::new(),
            created_at: Utc::now(),
            source_context: SourceContextSnapshot::default(),
        }
    }

    #[test]
    fn round_trips_a_plan() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plan.json");
        let plan = sample_plan();
        save_plan_to_file(&plan, &path).unwrap();
        let loaded = load_plan_from_file(&path).unwrap();
        assert_eq!(loaded.id, plan.id);
    }

    #[test]
    fn round_trips_a_package() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pkg.json");
        let plan = sample_plan();
        export_package(&plan, "sample", Some("me".to_string()), &path).unwrap();
        let package = import_package(&path).unwrap();
        assert_eq!(package.manifest.name, "sample");
        assert_eq!(package.plan.id, plan.id);
    }

    #[test]
    fn rejects_package_with_newer_schema_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pkg.json");
        let package = WorkflowPackage {
            manifest: PackageManifest {
                name: "future".into(),
                author: None,
                created_at: Utc::now(),
                schema_version: CURRENT_SCHEMA_VERSION + 1,
            },
            plan: sample_plan(),
        };
        fs::write(&path, serde_json::to_string_pretty(&package).unwrap()).unwrap();
        let result = import_package(&path);
        assert!(result.is_err());
    }
}
