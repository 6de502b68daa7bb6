//! Workspace skills — `skills/<name>/SKILL.md` files surfaced to the model
//! through the `<available_skills>` block of the system prompt.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub location: PathBuf,
}

/// Scan `<workspace>/skills/*/SKILL.md` for skill descriptors.
///
/// The description is the first non-heading, non-empty line of the file.
/// Unreadable entries are skipped.
pub fn discover(workspace_dir: &Path) -> Vec<Skill> {
    let skills_dir = workspace_dir.join("skills");
    let Ok(entries) = std::fs::read_dir(&skills_dir) else {
        return Vec::new();
    };

    let mut skills = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let manifest = path.join("SKILL.md");
        let Ok(content) = std::fs::read_to_string(&manifest) else {
            continue;
        };
        let name = entry.file_name().to_string_lossy().to_string();
        let description = content
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty() && !l.starts_with('#'))
            .unwrap_or("")
            .to_string();
        skills.push(Skill {
            name,
            description,
            location: manifest,
        });
    }

    skills.sort_by(|a, b| a.name.cmp(&b.name));
    skills
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_skills_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(discover(tmp.path()).is_empty());
    }

    #[test]
    fn discovers_name_and_first_body_line() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("skills/summarize");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("SKILL.md"),
            "# Summarize\n\nCondense long documents into bullet points.\n\nMore text.\n",
        )
        .unwrap();

        let skills = discover(tmp.path());
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].name, "summarize");
        assert_eq!(
            skills[0].description,
            "Condense long documents into bullet points."
        );
    }

    #[test]
    fn directories_without_manifest_are_skipped() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("skills/empty")).unwrap();
        assert!(discover(tmp.path()).is_empty());
    }

    #[test]
    fn output_is_sorted_by_name() {
        let tmp = TempDir::new().unwrap();
        for name in ["zeta", "alpha"] {
            let dir = tmp.path().join("skills").join(name);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("SKILL.md"), format!("{name} skill\n")).unwrap();
        }
        let names: Vec<String> = discover(tmp.path()).into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);
    }
}
