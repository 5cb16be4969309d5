//! Unified diff generation (Myers' O(ND) algorithm).
//!
//! The output is accepted by [`super::parse_patch`] and applying it with
//! [`super::apply_patch`] reproduces the new tree byte for byte, including
//! a missing trailing newline.

use std::fmt::Write as _;

use crate::task::FileTree;

/// Lines of context around each change.
pub const DEFAULT_CONTEXT: usize = 3;

/// A line plus whether it is terminated by `\n`.
///
/// Only the last line of a file can lack the terminator, and two lines are
/// equal only if both content and terminator agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Line<'a> {
    text: &'a [u8],
    newline: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Equal,
    Delete,
    Insert,
}

/// Diffs two trees file by file, in path order.
pub fn unified_diff(old: &FileTree, new: &FileTree) -> String {
    let mut out = String::new();
    let paths: std::collections::BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    for path in paths {
        let before = old.get(path).map(Vec::as_slice);
        let after = new.get(path).map(Vec::as_slice);
        if before == after {
            continue;
        }
        out.push_str(&diff_file(path, before, after, DEFAULT_CONTEXT));
    }
    out
}

/// Diffs one file. `None` means the file does not exist on that side.
///
/// Non UTF-8 content yields a git-style binary notice.
pub fn diff_file(path: &str, old: Option<&[u8]>, new: Option<&[u8]>, context: usize) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "diff --git a/{path} b/{path}");
    match (old, new) {
        (None, Some(_)) => out.push_str("new file mode 100644\n"),
        (Some(_), None) => out.push_str("deleted file mode 100644\n"),
        _ => {}
    }

    let old_bytes = old.unwrap_or_default();
    let new_bytes = new.unwrap_or_default();
    if std::str::from_utf8(old_bytes).is_err() || std::str::from_utf8(new_bytes).is_err() {
        let _ = writeln!(out, "Binary files a/{path} and b/{path} differ");
        return out;
    }

    let a = to_lines(old_bytes);
    let b = to_lines(new_bytes);
    if a.is_empty() && b.is_empty() {
        // Empty file created or deleted: the git header alone says it all.
        return out;
    }

    let old_label = if old.is_some() { format!("a/{path}") } else { "/dev/null".to_string() };
    let new_label = if new.is_some() { format!("b/{path}") } else { "/dev/null".to_string() };
    let _ = writeln!(out, "--- {old_label}");
    let _ = writeln!(out, "+++ {new_label}");

    let ops = myers(&a, &b);
    write_hunks(&mut out, &a, &b, &ops, context);
    out
}

fn to_lines(bytes: &[u8]) -> Vec<Line<'_>> {
    if bytes.is_empty() {
        return Vec::new();
    }
    let mut lines: Vec<Line<'_>> = bytes
        .split(|b| *b == b'\n')
        .map(|text| Line { text, newline: true })
        .collect();
    if bytes.ends_with(b"\n") {
        lines.pop();
    } else if let Some(last) = lines.last_mut() {
        last.newline = false;
    }
    lines
}

/// Shortest edit script from `a` to `b`.
fn myers(a: &[Line<'_>], b: &[Line<'_>]) -> Vec<Op> {
    let n = a.len() as isize;
    let m = b.len() as isize;
    let max = n + m;
    if max == 0 {
        return Vec::new();
    }

    let offset = max + 1;
    let mut v = vec![0isize; (2 * max + 3) as usize];
    let mut trace: Vec<Vec<isize>> = Vec::new();

    'outer: for d in 0..=max {
        trace.push(v.clone());
        let mut k = -d;
        while k <= d {
            let idx = (k + offset) as usize;
            let mut x = if k == -d || (k != d && v[idx - 1] < v[idx + 1]) {
                v[idx + 1]
            } else {
                v[idx - 1] + 1
            };
            let mut y = x - k;
            while x < n && y < m && a[x as usize] == b[y as usize] {
                x += 1;
                y += 1;
            }
            v[idx] = x;
            if x >= n && y >= m {
                break 'outer;
            }
            k += 2;
        }
    }

    // Walk the trace backwards to recover the path.
    let mut ops = Vec::with_capacity((n + m) as usize);
    let (mut x, mut y) = (n, m);
    for d in (0..trace.len() as isize).rev() {
        let v = &trace[d as usize];
        let k = x - y;
        let prev_k = if k == -d
            || (k != d && v[(k - 1 + offset) as usize] < v[(k + 1 + offset) as usize])
        {
            k + 1
        } else {
            k - 1
        };
        let prev_x = v[(prev_k + offset) as usize];
        let prev_y = prev_x - prev_k;

        while x > prev_x && y > prev_y {
            ops.push(Op::Equal);
            x -= 1;
            y -= 1;
        }
        if d > 0 {
            if x == prev_x {
                ops.push(Op::Insert);
            } else {
                ops.push(Op::Delete);
            }
        }
        x = prev_x;
        y = prev_y;
    }
    ops.reverse();
    ops
}

fn write_hunks(out: &mut String, a: &[Line<'_>], b: &[Line<'_>], ops: &[Op], context: usize) {
    // Position in each file before every op.
    let mut positions = Vec::with_capacity(ops.len() + 1);
    let (mut i, mut j) = (0usize, 0usize);
    for op in ops {
        positions.push((i, j));
        match op {
            Op::Equal => {
                i += 1;
                j += 1;
            }
            Op::Delete => i += 1,
            Op::Insert => j += 1,
        }
    }
    positions.push((i, j));

    let changes: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| **op != Op::Equal)
        .map(|(idx, _)| idx)
        .collect();
    if changes.is_empty() {
        return;
    }

    // Group changes whose context windows touch.
    let mut groups: Vec<(usize, usize)> = Vec::new();
    for &idx in &changes {
        let start = idx.saturating_sub(context);
        let end = (idx + 1 + context).min(ops.len());
        match groups.last_mut() {
            Some(last) if start <= last.1 => last.1 = end,
            _ => groups.push((start, end)),
        }
    }

    for (start, end) in groups {
        let slice = &ops[start..end];
        let old_len = slice.iter().filter(|op| **op != Op::Insert).count();
        let new_len = slice.iter().filter(|op| **op != Op::Delete).count();
        let (i0, j0) = positions[start];
        let old_start = if old_len == 0 { i0 } else { i0 + 1 };
        let new_start = if new_len == 0 { j0 } else { j0 + 1 };
        let _ = writeln!(out, "@@ -{old_start},{old_len} +{new_start},{new_len} @@");

        for (offset, op) in slice.iter().enumerate() {
            let (i, j) = positions[start + offset];
            let (marker, line) = match op {
                Op::Equal => (' ', a[i]),
                Op::Delete => ('-', a[i]),
                Op::Insert => ('+', b[j]),
            };
            out.push(marker);
            // Content was checked to be UTF-8 before diffing.
            out.push_str(&String::from_utf8_lossy(line.text));
            out.push('\n');
            if !line.newline {
                out.push_str("\\ No newline at end of file\n");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::{apply_patch, parse_patch, PathPolicy};

    fn tree(files: &[(&str, &str)]) -> FileTree {
        files
            .iter()
            .map(|(p, c)| (p.to_string(), c.as_bytes().to_vec()))
            .collect()
    }

    fn round_trip(old: &FileTree, new: &FileTree) {
        let text = unified_diff(old, new);
        let patch = parse_patch(&text).expect("generated diff should parse");
        let applied = apply_patch(old, &patch, &PathPolicy::default()).expect("should apply");
        assert_eq!(&applied.tree, new, "diff was:\n{text}");
    }

    #[test]
    fn test_identical_trees_give_empty_diff() {
        let t = tree(&[("a", "x\n")]);
        assert_eq!(unified_diff(&t, &t), "");
    }

    #[test]
    fn test_simple_change_format() {
        let old = tree(&[("f.py", "a\nb\nc\n")]);
        let new = tree(&[("f.py", "a\nB\nc\n")]);
        let text = unified_diff(&old, &new);
        assert_eq!(
            text,
            "diff --git a/f.py b/f.py\n--- a/f.py\n+++ b/f.py\n@@ -1,3 +1,3 @@\n a\n-b\n+B\n c\n"
        );
    }

    #[test]
    fn test_round_trip_trailing_newline_changes() {
        round_trip(&tree(&[("f", "a\nb")]), &tree(&[("f", "a\nb\n")]));
        round_trip(&tree(&[("f", "a\nb\n")]), &tree(&[("f", "a\nb")]));
        round_trip(&tree(&[("f", "a\nb")]), &tree(&[("f", "a\nc")]));
        round_trip(&tree(&[("f", "keep")]), &tree(&[("f", "keep"), ("g", "new")]));
    }

    #[test]
    fn test_round_trip_create_delete_and_crlf() {
        round_trip(
            &tree(&[("gone", "1\n2\n"), ("win.txt", "a\r\nb\r\n")]),
            &tree(&[("made", "x\n"), ("win.txt", "a\r\nB\r\n")]),
        );
        round_trip(&tree(&[]), &tree(&[("empty", "")]));
    }

    #[test]
    fn test_round_trip_multiple_hunks() {
        let old: String = (1..=40).map(|i| format!("line {i}\n")).collect();
        let new = old
            .replace("line 3\n", "line three\n")
            .replace("line 30\n", "")
            .replace("line 40\n", "line 40\nline 41\n");
        let text = unified_diff(&tree(&[("f", &old)]), &tree(&[("f", &new)]));
        assert_eq!(text.matches("@@ -").count(), 3);
        round_trip(&tree(&[("f", &old)]), &tree(&[("f", &new)]));
    }

    #[test]
    fn test_binary_content_is_flagged() {
        let mut old = FileTree::new();
        old.insert("bin".to_string(), vec![0xff, 0xfe, 0x00]);
        let new = FileTree::new();
        let text = unified_diff(&old, &new);
        assert!(text.contains("Binary files"));
        assert!(parse_patch(&text).is_err());
    }
}
