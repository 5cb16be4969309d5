//! Unified diff parser.
//!
//! Accepts plain `diff -u` output and `git diff` output. Hunk bodies are
//! kept as raw bytes so CR characters and missing trailing newlines survive
//! untouched.

use std::sync::OnceLock;

use regex::Regex;

use super::PatchRejected;

fn hunk_header() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@")
            .expect("Invalid regex for hunk header")
    })
}

/// A parsed patch: one entry per file section, in patch order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Patch {
    pub files: Vec<FilePatch>,
}

impl Patch {
    /// Returns true if the patch has no file sections.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Changes to one file. `None` on a side means `/dev/null`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub hunks: Vec<Hunk>,
}

/// What a file section does to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChange {
    Create,
    Delete,
    Modify,
}

impl FilePatch {
    /// Path of the file the section changes.
    pub fn target(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or_default()
    }

    pub fn change(&self) -> FileChange {
        match (&self.old_path, &self.new_path) {
            (None, _) => FileChange::Create,
            (_, None) => FileChange::Delete,
            _ => FileChange::Modify,
        }
    }
}

/// One `@@` hunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_len: usize,
    pub new_start: usize,
    pub new_len: usize,
    pub lines: Vec<HunkLine>,
    /// The old side's last line has no trailing newline.
    pub old_missing_newline: bool,
    /// The new side's last line has no trailing newline.
    pub new_missing_newline: bool,
}

impl Hunk {
    /// Lines the base must contain (context and removals), in order.
    pub fn old_lines(&self) -> Vec<&[u8]> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(b) | HunkLine::Remove(b) => Some(b.as_slice()),
                HunkLine::Add(_) => None,
            })
            .collect()
    }

    /// Lines of the post-image (context and additions), in order.
    pub fn new_lines(&self) -> Vec<&[u8]> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(b) | HunkLine::Add(b) => Some(b.as_slice()),
                HunkLine::Remove(_) => None,
            })
            .collect()
    }

    /// Zero-based index in the old file where this hunk starts.
    pub fn old_index(&self) -> usize {
        if self.old_len == 0 {
            self.old_start
        } else {
            self.old_start.saturating_sub(1)
        }
    }
}

/// A hunk body line without its leading marker or line terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(Vec<u8>),
    Remove(Vec<u8>),
    Add(Vec<u8>),
}

/// Parses unified diff text.
///
/// Whitespace-only input yields an empty patch. Text without any file
/// section is rejected rather than treated as a no-op.
pub fn parse_patch(text: &str) -> Result<Patch, PatchRejected> {
    if text.trim().is_empty() {
        return Ok(Patch::default());
    }

    let lines: Vec<&str> = split_lines(text);
    let mut parser = Parser {
        lines: &lines,
        pos: 0,
        files: Vec::new(),
    };
    parser.run()?;

    if parser.files.is_empty() {
        return Err(malformed(1, "no file sections found"));
    }
    Ok(Patch {
        files: parser.files,
    })
}

/// Splits on `\n`, keeping any `\r` inside the line.
fn split_lines(text: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = text.split('\n').collect();
    if text.ends_with('\n') {
        lines.pop();
    }
    lines
}

fn malformed(line: usize, reason: impl Into<String>) -> PatchRejected {
    PatchRejected::Malformed {
        line,
        reason: reason.into(),
    }
}

/// Section being assembled from git extended headers.
#[derive(Default)]
struct GitSection {
    old: Option<String>,
    new: Option<String>,
    new_file: bool,
    deleted_file: bool,
}

struct Parser<'a> {
    lines: &'a [&'a str],
    pos: usize,
    files: Vec<FilePatch>,
}

impl<'a> Parser<'a> {
    fn run(&mut self) -> Result<(), PatchRejected> {
        let mut git: Option<GitSection> = None;

        while self.pos < self.lines.len() {
            let line = self.lines[self.pos];
            let header = line.trim_end_matches('\r');

            if let Some(rest) = header.strip_prefix("diff --git ") {
                self.flush_git(git.take());
                let (old, new) = split_git_paths(rest);
                git = Some(GitSection {
                    old,
                    new,
                    ..Default::default()
                });
                self.pos += 1;
            } else if header.starts_with("GIT binary patch") || is_binary_notice(header) {
                return Err(malformed(self.pos + 1, "binary patches are not supported"));
            } else if header.starts_with("rename from ") || header.starts_with("copy from ") {
                return Err(malformed(self.pos + 1, "renames and copies are not supported"));
            } else if header.starts_with("new file mode") {
                if let Some(section) = git.as_mut() {
                    section.new_file = true;
                }
                self.pos += 1;
            } else if header.starts_with("deleted file mode") {
                if let Some(section) = git.as_mut() {
                    section.deleted_file = true;
                }
                self.pos += 1;
            } else if header.starts_with("--- ") && self.next_starts_with("+++ ") {
                git = None;
                self.parse_file_section()?;
            } else if header.starts_with("@@") {
                return Err(malformed(self.pos + 1, "hunk outside of a file section"));
            } else {
                // Preamble, index lines and mode lines carry nothing we need.
                self.pos += 1;
            }
        }

        self.flush_git(git.take());
        Ok(())
    }

    fn next_starts_with(&self, prefix: &str) -> bool {
        self.lines
            .get(self.pos + 1)
            .is_some_and(|l| l.starts_with(prefix))
    }

    /// Emits a git section that had no `---`/`+++` lines (empty create/delete).
    fn flush_git(&mut self, section: Option<GitSection>) {
        let Some(section) = section else { return };
        if section.new_file {
            self.files.push(FilePatch {
                old_path: None,
                new_path: section.new.or(section.old),
                hunks: Vec::new(),
            });
        } else if section.deleted_file {
            self.files.push(FilePatch {
                old_path: section.old.or(section.new),
                new_path: None,
                hunks: Vec::new(),
            });
        }
    }

    fn parse_file_section(&mut self) -> Result<(), PatchRejected> {
        let old_path = parse_header_path(&self.lines[self.pos][4..]);
        let new_path = parse_header_path(&self.lines[self.pos + 1][4..]);
        if old_path.is_none() && new_path.is_none() {
            return Err(malformed(self.pos + 1, "both sides are /dev/null"));
        }
        self.pos += 2;

        let mut hunks = Vec::new();
        while self.pos < self.lines.len() && self.lines[self.pos].starts_with("@@") {
            hunks.push(self.parse_hunk()?);
        }
        if hunks.is_empty() {
            return Err(malformed(self.pos, "file section without hunks"));
        }

        self.files.push(FilePatch {
            old_path,
            new_path,
            hunks,
        });
        Ok(())
    }

    fn parse_hunk(&mut self) -> Result<Hunk, PatchRejected> {
        let header_line = self.pos + 1;
        let header = self.lines[self.pos];
        let caps = hunk_header()
            .captures(header)
            .ok_or_else(|| malformed(header_line, format!("bad hunk header: {header}")))?;

        let number = |idx: usize, default: usize| -> Result<usize, PatchRejected> {
            match caps.get(idx) {
                Some(m) => m
                    .as_str()
                    .parse()
                    .map_err(|_| malformed(header_line, "hunk header number out of range")),
                None => Ok(default),
            }
        };
        let old_start = number(1, 0)?;
        let old_len = number(2, 1)?;
        let new_start = number(3, 0)?;
        let new_len = number(4, 1)?;
        self.pos += 1;

        let mut hunk = Hunk {
            old_start,
            old_len,
            new_start,
            new_len,
            lines: Vec::new(),
            old_missing_newline: false,
            new_missing_newline: false,
        };

        let (mut old_left, mut new_left) = (old_len, new_len);
        while old_left > 0 || new_left > 0 {
            let Some(line) = self.lines.get(self.pos) else {
                return Err(malformed(
                    self.pos,
                    format!("hunk at line {header_line} ends before its declared length"),
                ));
            };
            let bytes = line.as_bytes();
            let (marker, body) = match bytes.first() {
                Some(m) => (*m, bytes[1..].to_vec()),
                // Some tools strip the single space of an empty context line.
                None => (b' ', Vec::new()),
            };

            match marker {
                b' ' if old_left > 0 && new_left > 0 => {
                    old_left -= 1;
                    new_left -= 1;
                    hunk.lines.push(HunkLine::Context(body));
                }
                b'-' if old_left > 0 => {
                    old_left -= 1;
                    hunk.lines.push(HunkLine::Remove(body));
                }
                b'+' if new_left > 0 => {
                    new_left -= 1;
                    hunk.lines.push(HunkLine::Add(body));
                }
                b'\\' => self.apply_no_newline_marker(&mut hunk)?,
                _ => {
                    return Err(malformed(
                        self.pos + 1,
                        format!(
                            "hunk body does not match header counts (hunk at line {header_line})"
                        ),
                    ));
                }
            }
            self.pos += 1;
        }

        if self
            .lines
            .get(self.pos)
            .is_some_and(|l| l.starts_with('\\'))
        {
            self.apply_no_newline_marker(&mut hunk)?;
            self.pos += 1;
        }

        Ok(hunk)
    }

    fn apply_no_newline_marker(&self, hunk: &mut Hunk) -> Result<(), PatchRejected> {
        match hunk.lines.last() {
            Some(HunkLine::Context(_)) => {
                hunk.old_missing_newline = true;
                hunk.new_missing_newline = true;
            }
            Some(HunkLine::Remove(_)) => hunk.old_missing_newline = true,
            Some(HunkLine::Add(_)) => hunk.new_missing_newline = true,
            None => {
                return Err(malformed(
                    self.pos + 1,
                    "'\\ No newline at end of file' before any hunk line",
                ))
            }
        }
        Ok(())
    }
}

fn is_binary_notice(line: &str) -> bool {
    line.starts_with("Binary files ") && line.ends_with(" differ")
}

/// Parses a `---`/`+++` path: drops timestamps, quotes and the a/ b/ prefix.
fn parse_header_path(raw: &str) -> Option<String> {
    let raw = raw.trim_end_matches('\r');
    let path = raw.split('\t').next().unwrap_or(raw).trim_end();
    let path = unquote(path);
    if path == "/dev/null" {
        return None;
    }
    Some(strip_prefix(&path).to_string())
}

fn split_git_paths(rest: &str) -> (Option<String>, Option<String>) {
    let rest = rest.trim_end_matches('\r');
    match rest.find(" b/") {
        Some(idx) => (
            Some(strip_prefix(&unquote(&rest[..idx])).to_string()),
            Some(strip_prefix(&unquote(&rest[idx + 1..])).to_string()),
        ),
        None => (None, None),
    }
}

fn unquote(path: &str) -> String {
    path.strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .unwrap_or(path)
        .to_string()
}

fn strip_prefix(path: &str) -> &str {
    path.strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path)
}
