//! Knowledge documents for routed sections.
//!
//! Documents live anywhere below `.github/skills/`, one directory per section
//! holding a `SKILL.md`:
//!
//! ```text
//! .github/skills/
//! ├── architecture/
//! │   └── api-design/
//! │       └── SKILL.md
//! └── testing/
//!     └── SKILL.md
//! ```

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::routing::KnowledgeSection;

/// The filename for section content
pub const SKILL_FILE: &str = "SKILL.md";

/// A loaded knowledge document.
#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeDoc {
    pub section: KnowledgeSection,
    pub path: PathBuf,
    pub content: String,
}

impl KnowledgeDoc {
    /// The document formatted as a context section.
    pub fn as_context_section(&self) -> String {
        format!(
            "### {} ({})\n\n{}",
            self.section.as_str().to_uppercase().replace('-', " "),
            self.section.number(),
            self.content.trim()
        )
    }
}

/// Finds section documents under a skills directory.
#[derive(Debug)]
pub struct SkillsLoader {
    skills_dir: PathBuf,
    /// Section name -> SKILL.md path, built on first use
    index: Option<BTreeMap<String, PathBuf>>,
}

impl SkillsLoader {
    pub fn new(skills_dir: &Path) -> Self {
        Self {
            skills_dir: skills_dir.to_path_buf(),
            index: None,
        }
    }

    /// Walk the skills tree once. Paths are visited in sorted order so the
    /// first document for a section is the same on every run.
    fn index(&mut self) -> &BTreeMap<String, PathBuf> {
        let skills_dir = &self.skills_dir;
        self.index.get_or_insert_with(|| {
            let mut index = BTreeMap::new();
            if !skills_dir.is_dir() {
                return index;
            }
            for entry in WalkDir::new(skills_dir)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_file() || entry.file_name() != SKILL_FILE {
                    continue;
                }
                let Some(section) = entry
                    .path()
                    .parent()
                    .and_then(|dir| dir.file_name())
                    .and_then(|name| name.to_str())
                else {
                    continue;
                };
                index
                    .entry(section.to_lowercase())
                    .or_insert_with(|| entry.path().to_path_buf());
            }
            index
        })
    }

    /// Load the document for `section`, or `None` if there is none.
    pub fn load(&mut self, section: KnowledgeSection) -> Result<Option<KnowledgeDoc>> {
        let Some(path) = self.index().get(section.as_str()).cloned() else {
            return Ok(None);
        };
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read knowledge document: {}", path.display()))?;
        Ok(Some(KnowledgeDoc {
            section,
            path,
            content,
        }))
    }

    /// Sections that have a document on disk.
    pub fn available(&mut self) -> Vec<KnowledgeSection> {
        let index = self.index();
        KnowledgeSection::ALL
            .into_iter()
            .filter(|s| index.contains_key(s.as_str()))
            .collect()
    }
}
