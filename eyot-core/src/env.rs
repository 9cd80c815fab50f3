#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use eyot_ast::ModuleId;

/// Where source modules and the runtime live: the directory of the root
/// source file first, then the installed Eyot root.
#[derive(Clone, Debug)]
pub struct Environment {
    roots: Vec<PathBuf>,
}

impl Environment {
    /// Build the default environment from `EyotRoot`.
    pub fn create(local_path: &Path) -> Result<Environment, String> {
        let root = std::env::var("EyotRoot").unwrap_or_default();
        if root.is_empty() {
            return Err("EyotRoot is not set".to_string());
        }

        Ok(Environment {
            roots: vec![local_path.to_path_buf(), PathBuf::from(root)],
        })
    }

    pub fn with_roots(roots: Vec<PathBuf>) -> Environment {
        Environment { roots }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// The directory holding the C runtime sources.
    pub fn runtime_root(&self) -> PathBuf {
        let base = self.roots.get(1).or_else(|| self.roots.first());
        match base {
            Some(root) => root.join("runtime"),
            None => PathBuf::from("runtime"),
        }
    }

    /// Locate the source file for a dotted module path under the search
    /// roots.
    pub fn find_module(&self, id: &ModuleId) -> Option<PathBuf> {
        for root in &self.roots {
            let mut path = root.clone();
            for part in id.parts() {
                path.push(part);
            }
            path.set_extension("ey");

            if path.is_file() {
                return Some(path);
            }
        }

        None
    }
}
