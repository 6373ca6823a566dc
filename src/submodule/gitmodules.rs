//! `.gitmodules` declarations, read with libgit2's config parser.
//!
//! Only `submodule.<name>.{path,url,branch}` keys are collected. Everything
//! else in the file (other sections, unknown keys) is ignored.

use std::path::Path;

use git2::Config;
use thiserror::Error;

/// Branch assumed when a declaration has none
pub const DEFAULT_BRANCH: &str = "master";

const SUBMODULE_KEYS: &str = r"^submodule\..+\.(path|url|branch)$";

/// Errors returned while reading a declaration file.
#[derive(Error, Debug)]
pub enum GitmodulesError {
    #[error(transparent)]
    Config(#[from] git2::Error),
    #[error("submodule '{name}' has no '{key}'")]
    MissingKey { name: String, key: &'static str },
}

/// One `[submodule "..."]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmoduleDecl {
    pub name: String,
    pub path: String,
    pub url: String,
    pub branch: String,
}

#[derive(Default)]
struct Section {
    name: String,
    path: Option<String>,
    url: Option<String>,
    branch: Option<String>,
}

/// Read the declarations in `path`, in the order their sections first appear.
///
/// A section repeated later in the file merges into the first one; the last
/// value of a key wins.
pub fn read(path: &Path) -> Result<Vec<SubmoduleDecl>, GitmodulesError> {
    let config = Config::open(path)?;
    let mut sections: Vec<Section> = Vec::new();

    let mut entries = config.entries(Some(SUBMODULE_KEYS))?;
    while let Some(entry) = entries.next() {
        let entry = entry?;
        let (Some(name), Some(value)) = (entry.name(), entry.value()) else {
            continue;
        };
        let Some((submodule, key)) = name
            .strip_prefix("submodule.")
            .and_then(|rest| rest.rsplit_once('.'))
        else {
            continue;
        };

        let index = match sections.iter().position(|s| s.name == submodule) {
            Some(index) => index,
            None => {
                sections.push(Section {
                    name: submodule.to_string(),
                    ..Section::default()
                });
                sections.len() - 1
            }
        };
        let section = &mut sections[index];
        let value = Some(value.to_string());
        match key {
            "path" => section.path = value,
            "url" => section.url = value,
            "branch" => section.branch = value,
            _ => {}
        }
    }

    sections.into_iter().map(into_decl).collect()
}

fn into_decl(section: Section) -> Result<SubmoduleDecl, GitmodulesError> {
    let missing = |key| GitmodulesError::MissingKey {
        name: section.name.clone(),
        key,
    };
    let path = section.path.ok_or_else(|| missing("path"))?;
    let url = section.url.ok_or_else(|| missing("url"))?;
    let branch = section
        .branch
        .filter(|b| !b.is_empty())
        .unwrap_or_else(|| DEFAULT_BRANCH.to_string());
    Ok(SubmoduleDecl {
        name: section.name,
        path,
        url,
        branch,
    })
}
