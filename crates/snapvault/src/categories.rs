//! Semantic categories for files under the protected directory, and the glob
//! sets used to filter backups and restores by category.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Config,
    Secrets,
    Workspace,
    Sessions,
    Memory,
    Skills,
    Agents,
    Settings,
    Other,
}

/// Which side of the engine a glob is matched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Relative to the source directory being backed up.
    Backup,
    /// Relative to the archive root; matches at any depth.
    Restore,
}

impl Category {
    pub const ALL: [Category; 9] = [
        Category::Config,
        Category::Secrets,
        Category::Workspace,
        Category::Sessions,
        Category::Memory,
        Category::Skills,
        Category::Agents,
        Category::Settings,
        Category::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Secrets => "secrets",
            Self::Workspace => "workspace",
            Self::Sessions => "sessions",
            Self::Memory => "memory",
            Self::Skills => "skills",
            Self::Agents => "agents",
            Self::Settings => "settings",
            Self::Other => "other",
        }
    }

    pub fn globs(self, direction: Direction) -> &'static [&'static str] {
        match direction {
            Direction::Backup => backup_globs(self),
            Direction::Restore => restore_globs(self),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Category {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let want = s.trim().to_ascii_lowercase();
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == want)
            .ok_or_else(|| {
                let valid = Category::ALL
                    .iter()
                    .map(|c| c.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                Error::validation(format!("unknown category '{}' (valid: {valid})", s.trim()))
            })
    }
}

const ROOT_CONFIG_FILES: &[&str] = &[
    "openclaw.json",
    "openclaw.json5",
    "config.json",
    "config.yaml",
    "config.toml",
];
const SECRETS_PREFIXES: &[&str] = &["credentials/", "secrets/", ".secrets/", "keys/", ".env"];
const WORKSPACE_PREFIXES: &[&str] = &["workspace/", "workspaces/"];
const SKILLS_PREFIX: &str = "skills/";
const SESSION_SUFFIXES: &[&str] = &[".jsonl", ".json"];
const MEMORY_DIR: &str = "memory";
const MEMORY_FILE_PREFIX: &str = "memory";
const SETTINGS_PREFIXES: &[&str] = &["settings/", "preferences/"];

fn backup_globs(c: Category) -> &'static [&'static str] {
    match c {
        Category::Config => &[
            "openclaw.json",
            "openclaw.json5",
            "config.json",
            "config.yaml",
            "config.toml",
        ],
        Category::Secrets => &["credentials/**", "secrets/**", ".secrets/**", "keys/**", ".env*"],
        Category::Workspace => &["workspace/**", "workspaces/**"],
        Category::Sessions => &["**/sessions/**/*.jsonl", "**/sessions/**/*.json"],
        Category::Memory => &[
            "**/memory/**/*.sqlite*",
            "**/memory/**/*.db",
            "**/memory*.sqlite*",
            "**/memory*.db",
        ],
        Category::Skills => &["skills/**"],
        Category::Agents => &[
            "agents/*/agent/**",
            "agents/*/*.json",
            "agents/*/*.yaml",
            "agents/*/*.toml",
        ],
        Category::Settings => &["settings/**", "preferences/**"],
        Category::Other => &[],
    }
}

fn restore_globs(c: Category) -> &'static [&'static str] {
    match c {
        Category::Config => &[
            "**/openclaw.json",
            "**/openclaw.json5",
            "**/config.json",
            "**/config.yaml",
            "**/config.toml",
        ],
        Category::Secrets => &[
            "**/credentials/**",
            "**/secrets/**",
            "**/.secrets/**",
            "**/keys/**",
            "**/.env*",
        ],
        Category::Workspace => &["**/workspace/**", "**/workspaces/**"],
        Category::Sessions => &["**/sessions/**/*.jsonl", "**/sessions/**/*.json"],
        Category::Memory => &[
            "**/memory/**/*.sqlite*",
            "**/memory/**/*.db",
            "**/memory*.sqlite*",
            "**/memory*.db",
        ],
        Category::Skills => &["**/skills/**"],
        Category::Agents => &[
            "**/agents/*/agent/**",
            "**/agents/*/*.json",
            "**/agents/*/*.yaml",
            "**/agents/*/*.toml",
        ],
        Category::Settings => &["**/settings/**", "**/preferences/**"],
        Category::Other => &[],
    }
}

fn normalize(path: &str) -> String {
    let p = path.trim().replace('\\', "/");
    let mut p = p.as_str();
    loop {
        if let Some(rest) = p.strip_prefix("./") {
            p = rest;
        } else if let Some(rest) = p.strip_prefix('/') {
            p = rest;
        } else {
            break;
        }
    }
    p.to_string()
}

fn agent_config_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^agents/[^/]+/(agent/.+|[^/]+\.(json|json5|ya?ml|toml))$")
            .expect("valid agent config regex")
    })
}

// A sqlite file (or its journal) or a `.db` file, either under a `memory/`
// directory or itself named `memory*`.
fn is_memory_store(path: &str) -> bool {
    let (dirs, name) = path.rsplit_once('/').unwrap_or(("", path));
    if !(name.contains(".sqlite") || name.ends_with(".db")) {
        return false;
    }
    name.starts_with(MEMORY_FILE_PREFIX) || dirs.split('/').any(|seg| seg == MEMORY_DIR)
}

/// Map a path relative to the protected directory to its category. Rules are
/// ordered; the first match wins, so `workspace/skills/...` is workspace.
pub fn categorize(relative_path: &str) -> Category {
    let path = normalize(relative_path);
    let rooted = format!("/{path}");

    if ROOT_CONFIG_FILES.contains(&path.as_str()) {
        return Category::Config;
    }
    if SECRETS_PREFIXES.iter().any(|p| path.starts_with(p)) {
        return Category::Secrets;
    }
    if WORKSPACE_PREFIXES.iter().any(|p| path.starts_with(p)) {
        return Category::Workspace;
    }
    if path.starts_with(SKILLS_PREFIX) {
        return Category::Skills;
    }
    if rooted.contains("/sessions/") && SESSION_SUFFIXES.iter().any(|s| path.ends_with(s)) {
        return Category::Sessions;
    }
    if is_memory_store(&path) {
        return Category::Memory;
    }
    if agent_config_re().is_match(&path) {
        return Category::Agents;
    }
    if SETTINGS_PREFIXES.iter().any(|p| path.starts_with(p)) {
        return Category::Settings;
    }
    Category::Other
}

/// Include globs for a category name. `other` has none: it is "whatever no
/// other rule claims" and cannot be expressed as an include set.
pub fn includes_for(category: &str, direction: Direction) -> Result<&'static [&'static str]> {
    let c: Category = category.parse()?;
    Ok(c.globs(direction))
}

/// Union of include globs for several category names, in order, deduplicated.
pub fn includes_for_all<S: AsRef<str>>(
    categories: &[S],
    direction: Direction,
) -> Result<Vec<String>> {
    let mut out = Vec::<String>::new();
    for name in categories {
        let c: Category = name.as_ref().parse()?;
        if c == Category::Other {
            return Err(Error::validation(
                "category 'other' cannot be used as a filter; it has no include patterns",
            ));
        }
        for g in c.globs(direction) {
            if !out.iter().any(|e| e == g) {
                out.push((*g).to_string());
            }
        }
    }
    Ok(out)
}

/// Backup-direction exclude globs for categories the operator opted out of.
pub fn excludes_for<S: AsRef<str>>(categories: &[S]) -> Result<Vec<String>> {
    let mut out = Vec::<String>::new();
    for name in categories {
        let c: Category = name.as_ref().parse()?;
        for g in c.globs(Direction::Backup) {
            if !out.iter().any(|e| e == g) {
                out.push((*g).to_string());
            }
        }
    }
    Ok(out)
}
