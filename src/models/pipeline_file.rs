//! Pipeline description files.
//!
//! Stage DAGs are normally handed to the scheduler by a builder library;
//! the CLI accepts the same information as a TOML file so pipelines can be
//! driven without one. Dependencies are declared by stage name:
//!
//! ```toml
//! name = "mbm-nlin"
//!
//! [[stage]]
//! name = "blur"
//! command = ["mincblur", "-fwhm", "0.5", "img.mnc", "img_blur"]
//! inputs = ["img.mnc"]
//! outputs = ["img_blur.mnc"]
//! memory = 1.75
//!
//! [[stage]]
//! name = "register"
//! command = ["minctracc", "img_blur.mnc", "target.mnc", "out.xfm"]
//! depends = ["blur"]
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::stage::StageTemplate;

#[derive(Debug, Error)]
pub enum PipelineFileError {
    #[error("could not read pipeline file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("could not parse pipeline file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("pipeline file declares no stages")]
    Empty,
    #[error("duplicate stage name {0:?}")]
    DuplicateName(String),
    #[error("stage {stage:?} depends on unknown stage {dependency:?}")]
    UnknownDependency { stage: String, dependency: String },
    #[error("stage {0:?} has an empty command")]
    EmptyCommand(String),
}

/// Parsed pipeline description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineFile {
    /// Pipeline name, used to prefix log directories and backup paths.
    pub name: String,
    #[serde(default, rename = "stage")]
    pub stages: Vec<StageTemplate>,
}

impl PipelineFile {
    pub fn load(path: &Path) -> Result<Self, PipelineFileError> {
        let text = std::fs::read_to_string(path).map_err(|source| PipelineFileError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let file: Self = toml::from_str(&text).map_err(|source| PipelineFileError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        file.validate()?;
        Ok(file)
    }

    /// Structural checks that do not require building the DAG: every stage
    /// has a command, names are unique, and `depends` entries resolve.
    /// Cycle detection happens later, in the DAG's topological validation.
    pub fn validate(&self) -> Result<(), PipelineFileError> {
        if self.stages.is_empty() {
            return Err(PipelineFileError::Empty);
        }
        let mut names = std::collections::HashSet::new();
        for stage in &self.stages {
            if stage.command.is_empty() {
                return Err(PipelineFileError::EmptyCommand(stage.name.clone()));
            }
            if !names.insert(stage.name.as_str()) {
                return Err(PipelineFileError::DuplicateName(stage.name.clone()));
            }
        }
        for stage in &self.stages {
            for dep in &stage.depends {
                if !names.contains(dep.as_str()) {
                    return Err(PipelineFileError::UnknownDependency {
                        stage: stage.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
