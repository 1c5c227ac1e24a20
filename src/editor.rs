//! Jump from test output to the source line in an external editor.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

pub const DEFAULT_EDITOR: &str = "nvim";
pub const DEFAULT_ARGS: &str = "+{line} {file}";

fn location_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"([A-Za-z0-9_./\-]+\.go):(\d+)").ok())
        .as_ref()
}

/// A `file.go:line` reference found in output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLocation {
    pub file: String,
    pub line: u32,
}

impl FileLocation {
    /// Absolute path of the file. Test output names files relative to the
    /// package directory, so that is tried before the working directory.
    pub fn resolve(&self, package_dir: Option<&Path>, work_dir: &Path) -> PathBuf {
        let file = Path::new(&self.file);
        if file.is_absolute() {
            return file.to_path_buf();
        }
        if let Some(dir) = package_dir {
            let candidate = dir.join(file);
            if candidate.exists() {
                return candidate;
            }
        }
        work_dir.join(file)
    }
}

/// First file reference in `text`, if any.
pub fn find_location(text: &str) -> Option<FileLocation> {
    let captures = location_pattern()?.captures(text)?;
    let file = captures.get(1)?.as_str().to_string();
    let line = captures.get(2)?.as_str().parse().ok()?;
    Some(FileLocation { file, line })
}

/// External editor command and its argument template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Editor {
    /// May carry its own arguments, e.g. `code -w`.
    pub command: String,
    /// Whitespace-separated; `{file}` and `{line}` are substituted.
    pub args_template: String,
}

impl Editor {
    /// First of `command`, `$EDITOR`, then nvim.
    pub fn resolve(
        command: Option<String>,
        args_template: Option<String>,
        env_editor: Option<String>,
    ) -> Self {
        let command = command
            .or(env_editor)
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_EDITOR.to_string());
        Self {
            command,
            args_template: args_template.unwrap_or_else(|| DEFAULT_ARGS.to_string()),
        }
    }

    /// Program and full argument list for opening `file` at `line`.
    pub fn invocation(&self, file: &Path, line: u32) -> (String, Vec<String>) {
        let mut parts = self.command.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_else(|| DEFAULT_EDITOR.to_string());
        let file = file.display().to_string();
        let line = line.to_string();

        let mut args: Vec<String> = parts.collect();
        args.extend(
            self.args_template
                .split_whitespace()
                .map(|arg| arg.replace("{file}", &file).replace("{line}", &line)),
        );
        (program, args)
    }

    /// Blocking command; the caller owns the terminal while it runs.
    pub fn command(&self, file: &Path, line: u32) -> std::process::Command {
        let (program, args) = self.invocation(file, line);
        let mut command = std::process::Command::new(program);
        command.args(args);
        command
    }
}

impl Default for Editor {
    fn default() -> Self {
        Self::resolve(None, None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_location_in_failure_output() {
        let loc = find_location("    calc_test.go:42: expected 3, got 4").unwrap();
        assert_eq!(loc.file, "calc_test.go");
        assert_eq!(loc.line, 42);

        let loc = find_location("panic at /home/u/m/internal/x-y/z.go:7 +0x1d").unwrap();
        assert_eq!(loc.file, "/home/u/m/internal/x-y/z.go");
        assert_eq!(loc.line, 7);

        assert!(find_location("--- FAIL: TestAdd (0.00s)").is_none());
        assert!(find_location("notes.txt:12").is_none());
    }

    #[test]
    fn test_location_pattern_compiles() {
        assert!(location_pattern().is_some());
    }

    #[test]
    fn test_first_reference_wins() {
        let loc = find_location("a.go:1 then b.go:2").unwrap();
        assert_eq!(loc, FileLocation { file: "a.go".to_string(), line: 1 });
    }

    #[test]
    fn test_invocation_substitutes_template() {
        let editor = Editor::resolve(
            Some("code -w".to_string()),
            Some("--goto {file}:{line}".to_string()),
            None,
        );
        let (program, args) = editor.invocation(Path::new("/m/calc.go"), 9);
        assert_eq!(program, "code");
        assert_eq!(args, vec!["-w", "--goto", "/m/calc.go:9"]);

        let (program, args) = Editor::default().invocation(Path::new("x.go"), 3);
        assert_eq!(program, "nvim");
        assert_eq!(args, vec!["+3", "x.go"]);
    }

    #[test]
    fn test_resolve_order() {
        let flag = Editor::resolve(Some("hx".to_string()), None, Some("vim".to_string()));
        assert_eq!(flag.command, "hx");
        let env = Editor::resolve(None, None, Some("vim".to_string()));
        assert_eq!(env.command, "vim");
        let blank = Editor::resolve(None, None, Some("  ".to_string()));
        assert_eq!(blank.command, DEFAULT_EDITOR);
    }

    #[test]
    fn test_resolve_prefers_package_dir() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("calc");
        std::fs::create_dir_all(&pkg).unwrap();
        std::fs::write(pkg.join("calc_test.go"), "package calc").unwrap();

        let loc = FileLocation { file: "calc_test.go".to_string(), line: 1 };
        assert_eq!(loc.resolve(Some(&pkg), dir.path()), pkg.join("calc_test.go"));
        assert_eq!(loc.resolve(None, dir.path()), dir.path().join("calc_test.go"));
    }
}
