use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Name of the per-environment descriptor file
const ENVIRONMENT_CONFIG_FILE: &str = "config.json";
/// Sample file picked up when `config.json` lists no samples
const LEGACY_SAMPLE_FILE: &str = "sample";

/// One execution profile, e.g. a language toolchain image
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentDescriptor {
    pub id: String,
    pub display_name: String,
    /// Name the submitted source is written under inside the workspace
    pub file_name: String,
    pub sandbox_tag: String,
    pub samples: Vec<Sample>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub name: String,
    pub file_name: String,
    pub content: String,
}

#[derive(Deserialize)]
struct EnvironmentFile {
    display_name: Option<String>,
    file_name: String,
    sandbox_tag: Option<String>,
    samples: Option<Vec<SampleFile>>,
}

#[derive(Deserialize)]
struct SampleFile {
    name: String,
    file_name: String,
}

/// Read-only lookup table of every available environment
///
/// Built once at startup and shared between requests; nothing mutates it
/// afterwards.
#[derive(Debug, Default)]
pub struct EnvironmentRegistry {
    environments: BTreeMap<String, EnvironmentDescriptor>,
}

impl EnvironmentRegistry {
    /// Loads every `<dir>/<id>/config.json` into a descriptor
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let entries = fs::read_dir(dir)
            .with_context(|| format!("unable to read environments dir {}", dir.display()))?;

        let mut descriptors = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            let descriptor = load_environment(&id, &entry.path())
                .with_context(|| format!("invalid environment '{id}'"))?;
            log::debug!("Loaded environment {id} ({})", descriptor.display_name);
            descriptors.push(descriptor);
        }

        let registry = Self::from_descriptors(descriptors);
        log::info!(
            "Loaded {} environment(s) from {}",
            registry.len(),
            dir.display()
        );
        Ok(registry)
    }

    pub fn from_descriptors(descriptors: impl IntoIterator<Item = EnvironmentDescriptor>) -> Self {
        Self {
            environments: descriptors
                .into_iter()
                .map(|d| (d.id.clone(), d))
                .collect(),
        }
    }

    pub fn lookup(&self, id: &str) -> Option<&EnvironmentDescriptor> {
        self.environments.get(id)
    }

    /// Iterates the descriptors ordered by id
    pub fn iter(&self) -> impl Iterator<Item = &EnvironmentDescriptor> {
        self.environments.values()
    }

    pub fn len(&self) -> usize {
        self.environments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.environments.is_empty()
    }
}

fn load_environment(id: &str, dir: &Path) -> Result<EnvironmentDescriptor> {
    let config_path = dir.join(ENVIRONMENT_CONFIG_FILE);
    let data = fs::read(&config_path)
        .with_context(|| format!("unable to read {}", config_path.display()))?;
    let file: EnvironmentFile = serde_json::from_slice(&data)
        .with_context(|| format!("unable to parse {}", config_path.display()))?;

    let sample_files = match file.samples {
        Some(samples) => samples,
        None if dir.join(LEGACY_SAMPLE_FILE).is_file() => vec![SampleFile {
            name: "default".to_string(),
            file_name: LEGACY_SAMPLE_FILE.to_string(),
        }],
        None => Vec::new(),
    };

    let samples = sample_files
        .into_iter()
        .map(|s| {
            let path = dir.join(&s.file_name);
            let content = fs::read_to_string(&path)
                .with_context(|| format!("unable to read sample {}", path.display()))?;
            Ok(Sample {
                name: s.name,
                file_name: s.file_name,
                content,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(EnvironmentDescriptor {
        id: id.to_string(),
        display_name: file.display_name.unwrap_or_else(|| id.to_string()),
        file_name: file.file_name,
        sandbox_tag: file.sandbox_tag.unwrap_or_else(|| format!("dtc-{id}")),
        samples,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_load_reads_samples_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("rust/config.json"),
            r#"{"display_name": "Rust", "file_name": "main.rs",
                "samples": [{"name": "Hello", "file_name": "hello.rs"}]}"#,
        );
        write(&dir.path().join("rust/hello.rs"), "fn main() {}\n");
        write(
            &dir.path().join("golang/config.json"),
            r#"{"file_name": "main.go"}"#,
        );
        write(&dir.path().join("golang/sample"), "package main\n");
        write(&dir.path().join("README"), "not an environment");

        let registry = EnvironmentRegistry::load(dir.path()).unwrap();
        assert_eq!(registry.len(), 2);

        let ids: Vec<_> = registry.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["golang", "rust"]);

        let golang = registry.lookup("golang").unwrap();
        assert_eq!(golang.display_name, "golang");
        assert_eq!(golang.sandbox_tag, "dtc-golang");
        assert_eq!(golang.samples[0].name, "default");
        assert_eq!(golang.samples[0].content, "package main\n");

        let rust = registry.lookup("rust").unwrap();
        assert_eq!(rust.file_name, "main.rs");
        assert_eq!(
            rust.samples,
            vec![Sample {
                name: "Hello".to_string(),
                file_name: "hello.rs".to_string(),
                content: "fn main() {}\n".to_string(),
            }]
        );
    }

    #[test]
    fn test_load_fails_on_missing_sample() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("c/config.json"),
            r#"{"file_name": "main.c", "samples": [{"name": "x", "file_name": "gone.c"}]}"#,
        );
        assert!(EnvironmentRegistry::load(dir.path()).is_err());
    }

    #[test]
    fn test_lookup_unknown_id() {
        let registry = EnvironmentRegistry::default();
        assert!(registry.is_empty());
        assert!(registry.lookup("cobol").is_none());
    }

    #[test]
    fn test_bundled_environments_load() {
        let registry = EnvironmentRegistry::load("envs").unwrap();
        assert!(registry.lookup("golang").is_some());
        assert_eq!(registry.lookup("python").unwrap().samples.len(), 1);
    }
}
