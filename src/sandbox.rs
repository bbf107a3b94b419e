use std::path::{Component, Path, PathBuf};

use anyhow::bail;

pub const VIRTUAL_ROOT: &str = "/workspace";

// Translates the virtual paths clients speak ("/workspace/foo/bar") into
// physical paths under the workspace directory, and back again for watch
// events and listings. This is the only place that mapping happens.
#[derive(Debug, Clone)]
pub struct Sandbox {
    base_dir: PathBuf,
}

impl Sandbox {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    // Accepts "/workspace", "/workspace/foo", or a bare relative "foo/bar".
    // Anything whose cleaned form would climb above the base dir is rejected
    // before we touch the filesystem.
    pub fn resolve(&self, virtual_path: &str) -> anyhow::Result<PathBuf> {
        let rest = if virtual_path == VIRTUAL_ROOT {
            ""
        } else if let Some(rest) = virtual_path.strip_prefix("/workspace/") {
            rest
        } else {
            virtual_path
        };
        let rest = rest.trim_start_matches('/');

        let mut cleaned = Vec::new();
        for component in Path::new(rest).components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    if cleaned.pop().is_none() {
                        bail!("path {:?} escapes the workspace", virtual_path);
                    }
                }
                Component::Normal(part) => cleaned.push(part),
                // A rooted or prefixed component can't appear after the
                // trimming above, but reject rather than silently mangle.
                Component::RootDir | Component::Prefix(_) => {
                    bail!("unexpected absolute component in {:?}", virtual_path)
                }
            }
        }

        let mut resolved = self.base_dir.clone();
        for part in cleaned {
            resolved.push(part);
        }
        Ok(resolved)
    }

    // Physical back to virtual. Paths outside the base dir shouldn't occur
    // (the watcher only registers resolved paths), fall back to lossy display
    // so a bug shows up in the event rather than a panic.
    pub fn virtualize(&self, physical: &Path) -> String {
        match physical.strip_prefix(&self.base_dir) {
            Ok(rel) if rel.as_os_str().is_empty() => VIRTUAL_ROOT.to_owned(),
            Ok(rel) => format!("{}/{}", VIRTUAL_ROOT, rel.to_string_lossy()),
            Err(_) => physical.to_string_lossy().into_owned(),
        }
    }
}
