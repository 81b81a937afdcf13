//! Skill discovery and registry.
//!
//! A skill is a self-contained directory whose `SKILL.md` carries YAML
//! frontmatter between `---` delimiters:
//!
//! ```markdown
//! ---
//! name: pdf-tools
//! description: Extract, merge, and annotate PDF documents.
//! license: MIT
//! ---
//!
//! Full instructions for the agent...
//! ```
//!
//! Around the manifest the directory may hold `references/*.md`
//! (progressive-disclosure documents), `scripts/*.{py,sh,bash}` (helper
//! library and entry points), `assets/*`, and an optional `workflow.yaml`.
//! Discovery happens once at service init; the registry is read-only
//! afterwards and rebuilt on configuration reload.

pub mod tools;

pub use tools::SkillToolSource;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use serde::Deserialize;

const SKILL_FILENAME: &str = "SKILL.md";
const SCRIPT_EXTENSIONS: &[&str] = &["py", "sh", "bash"];

#[derive(Debug, thiserror::Error)]
pub enum SkillError {
    #[error("skill name '{0}' is not kebab-case")]
    InvalidName(String),

    #[error("duplicate skill name '{name}' ({first} and {second})")]
    DuplicateName {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("invalid frontmatter in {path}: {reason}")]
    Frontmatter { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// YAML frontmatter parsed from a SKILL.md file.
#[derive(Debug, Deserialize)]
struct SkillFrontmatter {
    name: String,
    description: String,
    #[serde(default)]
    license: Option<String>,
}

/// How much of a skill to assemble into context on a passive load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// Body plus every (or the filtered) reference document.
    #[default]
    Full,
    /// Just the SKILL.md body.
    Body,
    /// Name and description only.
    Summary,
}

/// One discovered skill.
#[derive(Debug)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub license: Option<String>,
    pub dir: PathBuf,
    pub references: Vec<PathBuf>,
    pub scripts: Vec<PathBuf>,
    pub assets: Vec<PathBuf>,
    pub has_workflow: bool,
    skill_md: PathBuf,
    body: OnceLock<String>,
}

impl Skill {
    /// The markdown body below the frontmatter, read lazily and cached.
    pub fn body(&self) -> &str {
        self.body.get_or_init(|| {
            match std::fs::read_to_string(&self.skill_md) {
                Ok(raw) => extract_frontmatter(&raw)
                    .map(|(_, body)| body.trim().to_string())
                    .unwrap_or_default(),
                Err(err) => {
                    tracing::warn!(path = %self.skill_md.display(), %err, "failed to re-read skill body");
                    String::new()
                }
            }
        })
    }

    /// Assemble the passive-load markdown context.
    ///
    /// `reference_filter` narrows by file stem; an empty filter keeps all.
    pub fn assemble_context(&self, mode: LoadMode, reference_filter: &[String]) -> String {
        let mut out = format!("# Skill: {}\n\n{}\n", self.name, self.description);

        if mode == LoadMode::Summary {
            return out;
        }

        let body = self.body();
        if !body.is_empty() {
            out.push('\n');
            out.push_str(body);
            out.push('\n');
        }

        if mode == LoadMode::Full {
            for reference in &self.references {
                let stem = reference
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default();
                if !reference_filter.is_empty()
                    && !reference_filter.iter().any(|f| f == &stem)
                {
                    continue;
                }
                if let Ok(contents) = std::fs::read_to_string(reference) {
                    out.push_str(&format!("\n## Reference: {}\n\n{}\n", stem, contents.trim()));
                }
            }
        }

        if !self.scripts.is_empty() {
            out.push_str("\n## Scripts\n\n");
            for script in &self.scripts {
                if let Some(name) = script.file_name() {
                    out.push_str(&format!("- /skill/{}\n", relative_display(&self.dir, script, name)));
                }
            }
        }

        out
    }
}

fn relative_display(dir: &Path, script: &Path, name: &std::ffi::OsStr) -> String {
    script
        .strip_prefix(dir)
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|_| name.to_string_lossy().to_string())
}

/// In-memory registry of discovered skills, keyed by name.
#[derive(Debug, Default)]
pub struct SkillRegistry {
    skills: BTreeMap<String, Arc<Skill>>,
}

impl SkillRegistry {
    /// Scan `root`: every immediate subdirectory containing `SKILL.md` is a
    /// candidate skill. Invalid or duplicate names fail the whole scan.
    pub fn discover(root: &Path) -> Result<Self, SkillError> {
        let mut skills: BTreeMap<String, Arc<Skill>> = BTreeMap::new();

        let entries = match std::fs::read_dir(root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(root = %root.display(), "skills root does not exist");
                return Ok(Self::default());
            }
            Err(err) => return Err(err.into()),
        };

        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let skill_md = dir.join(SKILL_FILENAME);
            if !skill_md.is_file() {
                continue;
            }

            let skill = parse_skill_dir(&dir, &skill_md)?;
            if let Some(existing) = skills.get(&skill.name) {
                return Err(SkillError::DuplicateName {
                    name: skill.name.clone(),
                    first: existing.dir.clone(),
                    second: dir,
                });
            }
            skills.insert(skill.name.clone(), Arc::new(skill));
        }

        tracing::info!(count = skills.len(), root = %root.display(), "discovered skills");
        Ok(Self { skills })
    }

    pub fn get(&self, name: &str) -> Option<Arc<Skill>> {
        self.skills.get(name).cloned()
    }

    pub fn list(&self) -> Vec<Arc<Skill>> {
        self.skills.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }
}

fn is_kebab_case(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && !name.ends_with('-')
        && !name.contains("--")
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn parse_skill_dir(dir: &Path, skill_md: &Path) -> Result<Skill, SkillError> {
    let raw = std::fs::read_to_string(skill_md)?;
    let (frontmatter, _body) =
        extract_frontmatter(&raw).ok_or_else(|| SkillError::Frontmatter {
            path: skill_md.to_path_buf(),
            reason: "missing `---` frontmatter delimiters".to_string(),
        })?;

    let fm: SkillFrontmatter =
        serde_yaml::from_str(&frontmatter).map_err(|e| SkillError::Frontmatter {
            path: skill_md.to_path_buf(),
            reason: e.to_string(),
        })?;

    if !is_kebab_case(&fm.name) {
        return Err(SkillError::InvalidName(fm.name));
    }

    let references = sorted_files(&dir.join("references"), Some(&["md"]));
    let mut scripts = sorted_files(&dir.join("scripts"), Some(SCRIPT_EXTENSIONS));
    // scripts may also sit at the top level of the skill directory
    scripts.extend(sorted_files(dir, Some(SCRIPT_EXTENSIONS)));
    let assets = sorted_files(&dir.join("assets"), None);
    let has_workflow = dir.join("workflow.yaml").is_file();

    Ok(Skill {
        name: fm.name,
        description: fm.description,
        license: fm.license,
        dir: dir.to_path_buf(),
        references,
        scripts,
        assets,
        has_workflow,
        skill_md: skill_md.to_path_buf(),
        body: OnceLock::new(),
    })
}

fn sorted_files(dir: &Path, extensions: Option<&[&str]>) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.is_file())
                .filter(|p| match extensions {
                    Some(allowed) => p
                        .extension()
                        .and_then(|e| e.to_str())
                        .map(|e| allowed.contains(&e))
                        .unwrap_or(false),
                    None => true,
                })
                .collect()
        })
        .unwrap_or_default();
    files.sort();
    files
}

/// Split a markdown document into (frontmatter, body). The frontmatter is
/// bounded by lines that are exactly `---`.
fn extract_frontmatter(contents: &str) -> Option<(String, String)> {
    let mut lines = contents.lines();
    if !matches!(lines.next(), Some(line) if line.trim() == "---") {
        return None;
    }

    let mut frontmatter_lines: Vec<&str> = Vec::new();
    let mut body_lines: Vec<&str> = Vec::new();
    let mut in_body = false;

    for line in lines {
        if !in_body {
            if line.trim() == "---" {
                in_body = true;
            } else {
                frontmatter_lines.push(line);
            }
        } else {
            body_lines.push(line);
        }
    }

    if frontmatter_lines.is_empty() || !in_body {
        return None;
    }

    Some((frontmatter_lines.join("\n"), body_lines.join("\n")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_skill(root: &Path, dir_name: &str, name: &str) -> PathBuf {
        let dir = root.join(dir_name);
        std::fs::create_dir_all(dir.join("references")).unwrap();
        std::fs::create_dir_all(dir.join("scripts")).unwrap();
        std::fs::write(
            dir.join(SKILL_FILENAME),
            format!(
                "---\nname: {}\ndescription: Does useful things.\nlicense: MIT\n---\n\nUse the helper library.\n",
                name
            ),
        )
        .unwrap();
        std::fs::write(dir.join("references/api.md"), "## API\n\ndetails").unwrap();
        std::fs::write(dir.join("scripts/helper.py"), "def run(): pass\n").unwrap();
        dir
    }

    #[test]
    fn test_discover_and_layout() {
        let root = tempfile::tempdir().unwrap();
        write_skill(root.path(), "pdf-tools", "pdf-tools");
        std::fs::create_dir_all(root.path().join("not-a-skill")).unwrap();

        let registry = SkillRegistry::discover(root.path()).unwrap();
        assert_eq!(registry.len(), 1);

        let skill = registry.get("pdf-tools").unwrap();
        assert_eq!(skill.description, "Does useful things.");
        assert_eq!(skill.license.as_deref(), Some("MIT"));
        assert_eq!(skill.references.len(), 1);
        assert_eq!(skill.scripts.len(), 1);
        assert!(!skill.has_workflow);
        assert_eq!(skill.body(), "Use the helper library.");
    }

    #[test]
    fn test_rejects_non_kebab_names() {
        let root = tempfile::tempdir().unwrap();
        write_skill(root.path(), "bad", "Bad_Name");
        assert!(matches!(
            SkillRegistry::discover(root.path()),
            Err(SkillError::InvalidName(_))
        ));
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let root = tempfile::tempdir().unwrap();
        write_skill(root.path(), "one", "same-name");
        write_skill(root.path(), "two", "same-name");
        assert!(matches!(
            SkillRegistry::discover(root.path()),
            Err(SkillError::DuplicateName { .. })
        ));
    }

    #[test]
    fn test_missing_root_is_empty() {
        let root = tempfile::tempdir().unwrap();
        let registry = SkillRegistry::discover(&root.path().join("nope")).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_assemble_context_modes() {
        let root = tempfile::tempdir().unwrap();
        write_skill(root.path(), "pdf-tools", "pdf-tools");
        let registry = SkillRegistry::discover(root.path()).unwrap();
        let skill = registry.get("pdf-tools").unwrap();

        let summary = skill.assemble_context(LoadMode::Summary, &[]);
        assert!(summary.contains("Does useful things."));
        assert!(!summary.contains("helper library"));

        let full = skill.assemble_context(LoadMode::Full, &[]);
        assert!(full.contains("Use the helper library."));
        assert!(full.contains("## Reference: api"));
        assert!(full.contains("- /skill/scripts/helper.py"));

        let filtered = skill.assemble_context(LoadMode::Full, &["other".to_string()]);
        assert!(!filtered.contains("## Reference: api"));
    }

    #[test]
    fn test_kebab_case_rules() {
        assert!(is_kebab_case("pdf-tools"));
        assert!(is_kebab_case("a1-b2"));
        assert!(!is_kebab_case("Pdf-Tools"));
        assert!(!is_kebab_case("-lead"));
        assert!(!is_kebab_case("trail-"));
        assert!(!is_kebab_case("double--dash"));
        assert!(!is_kebab_case("under_score"));
        assert!(!is_kebab_case(""));
    }
}
