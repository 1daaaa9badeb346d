//! Script files and the set of scripts in one run.
//!
//! A script is an INI-like text file:
//!
//! ```text
//! [Main]
//! Title=Shell
//!
//! [Variables]
//! %Dest%=%TargetDir%\Windows
//!
//! [Process]
//! Echo,Copying to %Dest%
//! ```
//!
//! Section lines are kept verbatim (comments and blanks included) so the
//! parser can report real line numbers.

use std::path::{Path, PathBuf};

use crate::script::command::ScriptId;

#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("section [{section}] not found in {script}")]
    MissingSection { script: String, section: String },
    #[error("script {0:?} not found")]
    UnknownScript(String),
}

// ── Script ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub lines: Vec<String>,
    /// 1-based line number of `lines[0]`.
    pub first_line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub path: PathBuf,
    pub title: String,
    sections: Vec<Section>,
}

fn section_header(line: &str) -> Option<&str> {
    let t = line.trim();
    t.strip_prefix('[')?.strip_suffix(']').map(str::trim)
}

impl Script {
    /// Parse script text.  Lines before the first header are ignored.
    pub fn parse(path: impl Into<PathBuf>, text: &str) -> Script {
        let mut sections: Vec<Section> = Vec::new();
        for (i, line) in text.lines().enumerate() {
            if let Some(name) = section_header(line) {
                sections.push(Section { name: name.to_owned(), lines: Vec::new(), first_line: i + 2 });
            } else if let Some(cur) = sections.last_mut() {
                cur.lines.push(line.to_owned());
            }
        }
        let mut script = Script { path: path.into(), title: String::new(), sections };
        script.title = script
            .key_values("Main")
            .into_iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("Title"))
            .map(|(_, v)| v)
            .unwrap_or_else(|| script.file_stem());
        script
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Script, ProjectError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|source| ProjectError::Io { path: path.to_owned(), source })?;
        Ok(Script::parse(path, &text))
    }

    fn file_stem(&self) -> String {
        self.path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default()
    }

    pub fn path_str(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    /// Directory containing the script.
    pub fn dir(&self) -> String {
        self.path.parent().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default()
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name.eq_ignore_ascii_case(name))
    }

    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter()
    }

    /// `Key=Value` lines of a section, in order.  Comment and blank lines
    /// and lines without `=` are skipped.
    pub fn key_values(&self, section: &str) -> Vec<(String, String)> {
        let Some(sec) = self.section(section) else {
            return Vec::new();
        };
        sec.lines
            .iter()
            .filter(|l| !crate::script::parser::is_blank(l))
            .filter_map(|l| l.split_once('='))
            .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
            .filter(|(k, _)| !k.is_empty())
            .collect()
    }

    /// Variable definitions of a section; `%` around keys is optional.
    pub fn variables(&self, section: &str) -> Vec<(String, String)> {
        self.key_values(section)
            .into_iter()
            .map(|(k, v)| {
                let name = k.strip_prefix('%').and_then(|r| r.strip_suffix('%')).unwrap_or(&k).to_owned();
                (name, v)
            })
            .collect()
    }

    /// Add or replace a `Key=Value` line, creating the section if needed.
    pub fn set_key(&mut self, section: &str, key: &str, value: &str) {
        let line = format!("{key}={value}");
        let idx = match self.sections.iter().position(|s| s.name.eq_ignore_ascii_case(section)) {
            Some(i) => i,
            None => {
                self.sections.push(Section { name: section.to_owned(), lines: Vec::new(), first_line: 0 });
                self.sections.len() - 1
            }
        };
        let sec = &mut self.sections[idx];
        let existing = sec.lines.iter().position(|l| {
            l.split_once('=').is_some_and(|(k, _)| k.trim().eq_ignore_ascii_case(key))
        });
        match existing {
            Some(i) => sec.lines[i] = line,
            None => sec.lines.push(line),
        }
    }
}

// ── Project ───────────────────────────────────────────────────────────────────

/// The scripts taking part in a run.  Scripts named by `Run`/`Exec` that are
/// not yet loaded are read from disk on demand.
#[derive(Debug, Clone, Default)]
pub struct Project {
    scripts: Vec<Script>,
}

impl Project {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, script: Script) -> ScriptId {
        self.scripts.push(script);
        self.scripts.len() - 1
    }

    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<ScriptId, ProjectError> {
        Ok(self.add(Script::load(path)?))
    }

    pub fn get(&self, id: ScriptId) -> Option<&Script> {
        self.scripts.get(id)
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    /// Find an already-loaded script by path, file name or title, relative to
    /// the script `from`.  Comparison ignores case.
    pub fn find(&self, reference: &str, from: ScriptId) -> Option<ScriptId> {
        let reference = reference.trim();
        let wanted = self.joined(reference, from);
        let eq = |a: &Path, b: &Path| a.to_string_lossy().eq_ignore_ascii_case(&b.to_string_lossy());
        self.scripts
            .iter()
            .position(|s| eq(&s.path, Path::new(reference)) || eq(&s.path, &wanted))
            .or_else(|| {
                self.scripts.iter().position(|s| {
                    s.path
                        .file_name()
                        .is_some_and(|n| n.to_string_lossy().eq_ignore_ascii_case(reference))
                })
            })
    }

    /// [`find`](Self::find), falling back to loading the file from disk.
    pub fn resolve(&mut self, reference: &str, from: ScriptId) -> Result<ScriptId, ProjectError> {
        if let Some(id) = self.find(reference, from) {
            return Ok(id);
        }
        let path = self.joined(reference.trim(), from);
        if !path.is_file() {
            return Err(ProjectError::UnknownScript(reference.to_owned()));
        }
        tracing::debug!(path = %path.display(), "loading referenced script");
        self.load(path)
    }

    fn joined(&self, reference: &str, from: ScriptId) -> PathBuf {
        let p = Path::new(reference);
        match self.get(from).and_then(|s| s.path.parent()) {
            Some(dir) if p.is_relative() => dir.join(p),
            _ => p.to_owned(),
        }
    }

    /// `true` if `section` exists in the script named by `reference`.
    /// Scripts not yet loaded are read from disk without being added.
    pub fn section_exists(&self, reference: &str, section: &str, from: ScriptId) -> bool {
        if let Some(script) = self.find(reference, from).and_then(|id| self.get(id)) {
            return script.section(section).is_some();
        }
        Script::load(self.joined(reference.trim(), from)).is_ok_and(|s| s.section(section).is_some())
    }

    /// Record a `Set ... PERMANENT` value in the script's variables section.
    /// Writing the file back is left to the caller.
    pub fn persist_variable(&mut self, id: ScriptId, section: &str, name: &str, value: &str) {
        if let Some(script) = self.scripts.get_mut(id) {
            script.set_key(section, &format!("%{name}%"), value);
        }
    }

    /// Record a `SetMacro ... PERMANENT` definition in the macro section.
    pub fn persist_macro(&mut self, id: ScriptId, section: &str, name: &str, command: &str) {
        if let Some(script) = self.scripts.get_mut(id) {
            script.set_key(section, name, command);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: &str = "\
; header comment
[Main]
Title=Shell Tweaks

[Variables]
%Dest%=X:\\Windows
Plain=1
// not a var

[Process]
Echo,one
Echo,two
";

    #[test]
    fn parses_sections_with_line_numbers() {
        let s = Script::parse("t.script", TEXT);
        let p = s.section("process").unwrap();
        assert_eq!(p.name, "Process");
        assert_eq!(p.first_line, 11);
        assert_eq!(p.lines[0], "Echo,one");
        assert_eq!(s.sections().count(), 3);
    }

    #[test]
    fn title_from_main_or_file_stem() {
        assert_eq!(Script::parse("t.script", TEXT).title, "Shell Tweaks");
        assert_eq!(Script::parse("dir/other.script", "[Process]\n").title, "other");
    }

    #[test]
    fn variables_strip_percent() {
        let s = Script::parse("t.script", TEXT);
        assert_eq!(
            s.variables("Variables"),
            vec![("Dest".to_owned(), "X:\\Windows".to_owned()), ("Plain".to_owned(), "1".to_owned())]
        );
    }

    #[test]
    fn set_key_replaces_or_appends() {
        let mut s = Script::parse("t.script", TEXT);
        s.set_key("Variables", "%dest%", "Y:");
        s.set_key("ApiVar", "Hello", "Echo,hi");
        assert_eq!(s.variables("Variables")[0], ("dest".to_owned(), "Y:".to_owned()));
        assert_eq!(s.key_values("ApiVar"), vec![("Hello".to_owned(), "Echo,hi".to_owned())]);
    }

    #[test]
    fn find_by_path_or_file_name() {
        let mut p = Project::new();
        let a = p.add(Script::parse("/proj/a.script", "[Process]\n"));
        let b = p.add(Script::parse("/proj/sub/B.script", "[Process]\n"));
        assert_eq!(p.find("/proj/a.script", b), Some(a));
        assert_eq!(p.find("b.script", a), Some(b));
        assert_eq!(p.find("sub/b.SCRIPT", a), Some(b));
        assert_eq!(p.find("missing.script", a), None);
        assert!(p.section_exists("a.script", "process", b));
        assert!(!p.section_exists("a.script", "Other", b));
    }

    #[test]
    fn resolve_loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("main.script");
        std::fs::write(&main, "[Process]\nRun,lib.script,Go\n").unwrap();
        std::fs::write(dir.path().join("lib.script"), "[Go]\nEcho,hi\n").unwrap();

        let mut p = Project::new();
        let id = p.load(&main).unwrap();
        let lib = p.resolve("lib.script", id).unwrap();
        assert_eq!(p.len(), 2);
        assert!(p.get(lib).unwrap().section("Go").is_some());
        assert!(matches!(p.resolve("nope.script", id), Err(ProjectError::UnknownScript(_))));
    }

    #[test]
    fn load_missing_file_is_io_error() {
        assert!(matches!(Script::load("/no/such/file.script"), Err(ProjectError::Io { .. })));
    }
}
