//! Locates Claude Code project log directories.
//!
//! Claude Code keeps one directory per working directory under
//! `~/.claude/projects`, named after the working directory's path with every
//! character that is not an ASCII letter or digit replaced by `-`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::cache::MemoryCache;
use crate::processor::list_log_files;
use crate::types::ProjectRef;

pub fn claude_projects_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".claude").join("projects"))
}

/// Every direct subdirectory of `root` holding at least one `.jsonl` log,
/// sorted by directory name.
pub fn discover_projects(root: &Path) -> Result<Vec<ProjectRef>> {
    let pattern = format!(
        "{}/*",
        glob::Pattern::escape(&root.to_string_lossy())
    );

    let mut projects = Vec::new();
    for entry in glob::glob(&pattern).context("Invalid projects directory pattern")? {
        let path = entry?;
        if !path.is_dir() {
            continue;
        }
        if list_log_files(&path).map_or(true, |files| files.is_empty()) {
            continue;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        projects.push(ProjectRef::new(name, path));
    }

    projects.sort_by(|a, b| a.display_name.cmp(&b.display_name));
    Ok(projects)
}

/// Flags the projects currently resident in the memory cache.
pub fn mark_in_cache(projects: &mut [ProjectRef], memory: &MemoryCache) {
    for project in projects {
        project.in_cache = memory.contains(&project.log_path);
    }
}

pub fn encode_project_path(path: &Path) -> String {
    path.to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Projects whose working directory is `rollup_path` or lies beneath it.
pub fn rollup_children(projects: &[ProjectRef], rollup_path: &Path) -> Vec<ProjectRef> {
    let prefix = encode_project_path(rollup_path);
    let prefix = prefix.trim_end_matches('-');

    projects
        .iter()
        .filter(|project| {
            let Some(name) = project.log_path.file_name() else {
                return false;
            };
            let name = name.to_string_lossy();
            match name.strip_prefix(prefix) {
                Some(rest) => rest.is_empty() || rest.starts_with('-'),
                None => false,
            }
        })
        .cloned()
        .collect()
}

/// Looks a project up by directory name, display name or full path.
pub fn find_project<'a>(projects: &'a [ProjectRef], needle: &str) -> Option<&'a ProjectRef> {
    projects.iter().find(|p| {
        p.display_name == needle
            || p.log_path == Path::new(needle)
            || p.log_path
                .file_name()
                .is_some_and(|name| name.to_string_lossy() == needle)
    })
}
