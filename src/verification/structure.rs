//! Structural similarity to the reference fix.
//!
//! Collects the tokens the reference patch adds on net (added lines minus
//! removed lines) and measures how many of them the candidate adds on net
//! to the same files, relative to the starting tree. Counts are per token
//! text, so a token the reference adds twice must be added twice. Tokens the
//! starting tree already holds never count, so the unpatched tree matches
//! nothing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::lexer::{tokenize, Language};
use crate::patch::{FileChange, HunkLine, Patch};
use crate::task::FileTree;

/// Net added-token counts of a reference patch, per file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceStructure {
    files: BTreeMap<String, BTreeMap<String, usize>>,
    total: usize,
}

/// How much of the reference structure a candidate reproduced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StructureMatch {
    pub matched: usize,
    pub total: usize,
    pub share: f64,
}

impl StructureMatch {
    pub fn reaches(&self, threshold: f64) -> bool {
        self.share + 1e-9 >= threshold
    }
}

impl ReferenceStructure {
    /// Builds the token counts; `None` if the reference adds no tokens.
    pub fn from_patch(patch: &Patch) -> Option<Self> {
        let mut files = BTreeMap::new();
        let mut total = 0;

        for file in &patch.files {
            if file.change() == FileChange::Delete {
                continue;
            }
            let path = file.target().to_string();
            let mut added = Vec::new();
            let mut removed = Vec::new();
            for hunk in &file.hunks {
                for line in &hunk.lines {
                    let (side, bytes) = match line {
                        HunkLine::Add(bytes) => (&mut added, bytes),
                        HunkLine::Remove(bytes) => (&mut removed, bytes),
                        HunkLine::Context(_) => continue,
                    };
                    side.extend_from_slice(bytes);
                    side.push(b'\n');
                }
            }

            let language = Language::from_path(&path);
            let counts = net_added(
                &count_tokens(&removed, language),
                count_tokens(&added, language),
            );
            let file_total: usize = counts.values().sum();
            if file_total == 0 {
                continue;
            }
            total += file_total;
            let entry: &mut BTreeMap<String, usize> = files.entry(path).or_default();
            for (token, n) in counts {
                *entry.entry(token).or_default() += n;
            }
        }

        (total > 0).then_some(Self { files, total })
    }

    /// Measures what the candidate added to `start` against the reference
    /// tokens.
    pub fn evaluate(&self, start: &FileTree, post_image: &FileTree) -> StructureMatch {
        let mut matched = 0;
        for (path, wanted) in &self.files {
            let Some(content) = post_image.get(path) else {
                continue;
            };
            let language = Language::from_path(path);
            let before = start
                .get(path)
                .map(|bytes| count_tokens(bytes, language))
                .unwrap_or_default();
            let added = net_added(&before, count_tokens(content, language));
            matched += wanted
                .iter()
                .map(|(token, n)| (*n).min(added.get(token).copied().unwrap_or(0)))
                .sum::<usize>();
        }

        StructureMatch {
            matched,
            total: self.total,
            share: matched as f64 / self.total as f64,
        }
    }

    pub fn total_tokens(&self) -> usize {
        self.total
    }
}

fn count_tokens(source: &[u8], language: Language) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for token in tokenize(source, language) {
        *counts.entry(token.text).or_default() += 1;
    }
    counts
}

/// Multiset difference `after - before`, dropping tokens that did not grow.
fn net_added(
    before: &BTreeMap<String, usize>,
    mut after: BTreeMap<String, usize>,
) -> BTreeMap<String, usize> {
    after.retain(|token, n| {
        *n = n.saturating_sub(before.get(token).copied().unwrap_or(0));
        *n > 0
    });
    after
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::parse_patch;

    const REFERENCE: &str = "\
--- a/src/anim.c
+++ b/src/anim.c
@@ -1,3 +1,3 @@
 void step(int *frame) {
-    if (*frame > MAX) *frame = 0;
+    if (*frame >= MAX) *frame = 0;
 }
";

    const START: &str = "void step(int *frame) {\n    if (*frame > MAX) *frame = 0;\n}\n";

    fn tree(content: &str) -> FileTree {
        [("src/anim.c".to_string(), content.as_bytes().to_vec())]
            .into_iter()
            .collect()
    }

    fn reference(text: &str) -> ReferenceStructure {
        let patch = parse_patch(text).expect("parse");
        ReferenceStructure::from_patch(&patch).expect("tokens")
    }

    #[test]
    fn test_reference_counts_net_added_tokens() {
        let reference = reference(REFERENCE);
        assert_eq!(reference.total_tokens(), 1);
    }

    #[test]
    fn test_reference_post_image_matches_fully() {
        let result = reference(REFERENCE).evaluate(
            &tree(START),
            &tree("void step(int *frame) {\n    if (*frame >= MAX) *frame = 0;\n}\n"),
        );
        assert_eq!(result.matched, result.total);
        assert!(result.reaches(1.0));
    }

    #[test]
    fn test_unpatched_tree_does_not_reach_threshold() {
        let result = reference(REFERENCE).evaluate(&tree(START), &tree(START));
        assert_eq!(result.matched, 0);
        assert!(!result.reaches(0.5));
    }

    #[test]
    fn test_partial_match_counts_tokens() {
        let reference = reference(
            "--- a/src/anim.c\n+++ b/src/anim.c\n@@ -1,3 +1,4 @@\n void step(int *frame) {\n+    if (*frame < 0) *frame = 0;\n     if (*frame > MAX) *frame = 0;\n }\n",
        );
        // Adds the guard's condition but resets to MAX instead of zero.
        let result = reference.evaluate(
            &tree(START),
            &tree(
                "void step(int *frame) {\n    if (*frame < 0) *frame = MAX;\n    if (*frame > MAX) *frame = 0;\n}\n",
            ),
        );
        assert!(result.matched < result.total);
        assert!(result.reaches(0.5));
        assert!(!result.reaches(1.0));
    }

    #[test]
    fn test_unrelated_edit_matches_nothing() {
        let result = reference(REFERENCE).evaluate(
            &tree(START),
            &tree("void step(int *frame) {\n    if (*frame > MAX) *frame = 1;\n}\n"),
        );
        assert_eq!(result.matched, 0);
    }

    #[test]
    fn test_missing_file_matches_nothing() {
        let result = reference(REFERENCE).evaluate(&tree(START), &FileTree::new());
        assert_eq!(result.matched, 0);
        assert_eq!(result.share, 0.0);
    }

    #[test]
    fn test_removal_only_reference_has_no_structure() {
        let patch = parse_patch(
            "--- a/x.c\n+++ b/x.c\n@@ -1,2 +1,1 @@\n keep();\n-drop();\n",
        )
        .expect("parse");
        assert!(ReferenceStructure::from_patch(&patch).is_none());
    }
}
