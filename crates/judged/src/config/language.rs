use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Deserializer, Serialize, de};

use crate::config::ConfigError;
use crate::types::Constraints;

/// Default PATH for sandbox execution
pub const DEFAULT_SANDBOX_PATH: &str = "/usr/bin:/bin";

const SOURCE_PLACEHOLDER: &str = "{src_path}";
const BINARY_PLACEHOLDER: &str = "{binary_path}";

/// Configuration for a programming language
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Language {
    /// Human-readable name for the language (e.g., "C++ 17 (GCC)")
    pub name: String,

    /// File the submission source is written to inside the slot
    pub source_name: SandboxFileName,

    /// File the compiler produces inside the slot
    #[serde(default = "default_binary_name")]
    pub binary_name: SandboxFileName,

    /// Compiler argv template; `None` for interpreted languages
    #[serde(default)]
    pub compile: Option<Vec<String>>,

    /// Execution argv template
    pub execute: Vec<String>,

    /// Limits for solution runs when the task carries none
    #[serde(default)]
    pub constraints: Constraints,

    /// Limits for the compiler run; falls back to the run limits
    #[serde(default)]
    pub compile_constraints: Option<Constraints>,

    /// Environment variables for both compile and execute
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// PATH environment variable for the sandbox
    #[serde(default = "default_sandbox_path")]
    pub path: String,
}

impl Language {
    /// Check if the language is compiled
    pub fn is_compiled(&self) -> bool {
        self.compile.is_some()
    }

    /// File stored in the binaries bucket and executed when grading.
    ///
    /// Interpreted languages ship their source as the artifact.
    pub fn artifact_name(&self) -> &SandboxFileName {
        if self.is_compiled() {
            &self.binary_name
        } else {
            &self.source_name
        }
    }

    /// Expanded compiler argv, if the language is compiled
    pub fn compile_command(&self) -> Option<Vec<String>> {
        self.compile.as_ref().map(|template| {
            Self::expand_command(
                template,
                self.source_name.as_str(),
                self.binary_name.as_str(),
            )
        })
    }

    /// Expanded execution argv
    pub fn execute_command(&self) -> Vec<String> {
        Self::expand_command(
            &self.execute,
            self.source_name.as_str(),
            self.artifact_name().as_str(),
        )
    }

    /// Limits for the compiler run given the limits resolved for the task
    pub fn compile_limits(&self, task_constraints: Constraints) -> Constraints {
        self.compile_constraints.unwrap_or(task_constraints)
    }

    /// Environment passed to every sandboxed run of this language
    pub fn sandbox_env(&self) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.insert("PATH".to_string(), self.path.clone());
        env
    }

    /// Substitute sandbox-relative paths into an argv template.
    ///
    /// Only file paths are substituted; submission content never reaches argv.
    pub fn expand_command(template: &[String], source: &str, binary: &str) -> Vec<String> {
        template
            .iter()
            .map(|arg| {
                arg.replace(SOURCE_PLACEHOLDER, source)
                    .replace(BINARY_PLACEHOLDER, binary)
            })
            .collect()
    }
}

/// A file name inside a slot's working root: one non-empty path component
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxFileName(String);

impl SandboxFileName {
    pub fn new(name: &str) -> Result<Self, ConfigError> {
        let invalid =
            name.is_empty() || name == "." || name.contains("..") || name.contains(['/', '\0']);
        if invalid {
            return Err(ConfigError::InvalidFileName(name.to_owned()));
        }
        Ok(Self(name.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for SandboxFileName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        SandboxFileName::new(&s).map_err(|_| {
            de::Error::invalid_value(
                de::Unexpected::Str(&s),
                &"a file name without '/' or '..' that is not '.'",
            )
        })
    }
}

impl std::fmt::Display for SandboxFileName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn default_binary_name() -> SandboxFileName {
    SandboxFileName("main".to_owned())
}

fn default_sandbox_path() -> String {
    DEFAULT_SANDBOX_PATH.to_owned()
}
