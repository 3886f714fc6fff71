//! Project language environments and their sandbox images.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Python,
    Node,
    Java,
    #[default]
    Base,
}

impl Environment {
    /// Parse an environment name. Anything unrecognized selects `Base`.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "python" => Environment::Python,
            "node" => Environment::Node,
            "java" => Environment::Java,
            _ => Environment::Base,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Python => "python",
            Environment::Node => "node",
            Environment::Java => "java",
            Environment::Base => "base",
        }
    }

    /// Image for this environment, e.g. `codeblocking/node`.
    pub fn image(self, prefix: &str) -> String {
        format!("{}/{}", prefix.trim_end_matches('/'), self.as_str())
    }

    /// Guess the environment from the files at the top of a project directory.
    /// Mixed or unknown projects get `Base`.
    pub fn detect(project_path: &Path) -> Self {
        let Ok(entries) = std::fs::read_dir(project_path) else {
            return Environment::Base;
        };

        let (mut python, mut node, mut java) = (false, false, false);
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            python |= is_python_marker(&name);
            node |= is_node_marker(&name);
            java |= is_java_marker(&name);
        }

        match (python, node, java) {
            (true, false, false) => Environment::Python,
            (false, true, false) => Environment::Node,
            (false, false, true) => Environment::Java,
            _ => Environment::Base,
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_python_marker(name: &str) -> bool {
    matches!(
        name,
        "requirements.txt" | "setup.py" | "pyproject.toml" | "Pipfile"
    ) || name.ends_with(".py")
}

fn is_node_marker(name: &str) -> bool {
    name == "package.json"
        || [".js", ".ts", ".jsx", ".tsx"]
            .iter()
            .any(|ext| name.ends_with(ext))
}

fn is_java_marker(name: &str) -> bool {
    matches!(name, "pom.xml" | "build.gradle" | "build.gradle.kts") || name.ends_with(".java")
}
