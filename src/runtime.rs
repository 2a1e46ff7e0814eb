use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;

const BIN_DIR: &str = "bin";
const JAVA: &str = "java";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeDescriptor {
    pub path: PathBuf,
    pub name: String,
    pub is_default: bool,
}

pub fn java_binary(root: &Path) -> PathBuf {
    root.join(BIN_DIR).join(JAVA)
}

pub fn default_runtime(runtimes: &[RuntimeDescriptor]) -> Option<&RuntimeDescriptor> {
    runtimes.iter().find(|r| r.is_default)
}

/// Source of the runtimes a server may be launched with. Rebuilt on every call.
#[async_trait]
pub trait RuntimeCatalog: Send + Sync {
    async fn discover(&self) -> Vec<RuntimeDescriptor>;
}

/// Finds Java installations on the `PATH` (the first one becomes the
/// default) and in a list of directories scanned one level deep.
#[derive(Debug, Clone)]
pub struct RuntimeDiscovery {
    pub search_path: bool,
    pub scan_dirs: Vec<PathBuf>,
}

impl RuntimeDiscovery {
    pub fn new(scan_dirs: Vec<PathBuf>) -> Self {
        Self {
            search_path: true,
            scan_dirs,
        }
    }

    async fn path_candidates(&self) -> Vec<PathBuf> {
        let lookup = if cfg!(windows) {
            Command::new("where").arg(JAVA).output().await
        } else {
            Command::new("which").arg("-a").arg(JAVA).output().await
        };
        let output = match lookup {
            Ok(output) => output,
            Err(e) => {
                tracing::debug!("java lookup on PATH failed: {}", e);
                return Vec::new();
            }
        };
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter_map(|line| {
                // Follow the alternatives chain to the real installation.
                let binary = std::fs::canonicalize(line).ok()?;
                binary.parent()?.parent().map(Path::to_path_buf)
            })
            .collect()
    }
}

#[async_trait]
impl RuntimeCatalog for RuntimeDiscovery {
    async fn discover(&self) -> Vec<RuntimeDescriptor> {
        let mut runtimes: Vec<RuntimeDescriptor> = Vec::new();
        let mut checked: Vec<PathBuf> = Vec::new();

        if self.search_path {
            for root in self.path_candidates().await {
                if checked.contains(&root) {
                    continue;
                }
                checked.push(root.clone());
                if is_java_dir(&root) {
                    let is_default = runtimes.is_empty();
                    runtimes.push(describe(&root, is_default).await);
                }
            }
        }

        for dir in &self.scan_dirs {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            let mut roots: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
            roots.sort();
            for root in roots {
                if checked.contains(&root) || !is_java_dir(&root) {
                    continue;
                }
                checked.push(root.clone());
                runtimes.push(describe(&root, false).await);
            }
        }

        runtimes
    }
}

/// Static catalog, handy when the set of runtimes is known up front.
#[derive(Debug, Clone, Default)]
pub struct FixedRuntimes(pub Vec<RuntimeDescriptor>);

#[async_trait]
impl RuntimeCatalog for FixedRuntimes {
    async fn discover(&self) -> Vec<RuntimeDescriptor> {
        self.0.clone()
    }
}

fn is_java_dir(path: &Path) -> bool {
    if !path.is_dir() {
        return false;
    }
    let Ok(entries) = std::fs::read_dir(path.join(BIN_DIR)) else {
        return false;
    };
    entries
        .flatten()
        .any(|entry| entry.path().file_stem().is_some_and(|stem| stem == JAVA))
}

async fn describe(root: &Path, is_default: bool) -> RuntimeDescriptor {
    let name = match Command::new(java_binary(root)).arg("-version").output().await {
        // `java -version` reports on stderr; the second line names the build.
        Ok(output) => {
            let text = String::from_utf8_lossy(&output.stderr);
            let mut lines = text.lines().map(str::trim);
            let first = lines.next().unwrap_or_default().to_string();
            lines.next().map(str::to_string).unwrap_or(first)
        }
        Err(e) => {
            tracing::debug!("failed to query version of {}: {}", root.display(), e);
            String::new()
        }
    };
    RuntimeDescriptor {
        path: root.to_path_buf(),
        name,
        is_default,
    }
}
