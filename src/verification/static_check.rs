//! Syntax-aware source pattern checks.
//!
//! Patterns are token sequences written in the language of the file they
//! scan. Three wildcards are understood:
//!
//! - `$name` matches one token and binds it; later `$name`s must match the
//!   same text
//! - `$_` matches any single token
//! - `...` matches any (possibly empty) run of tokens that does not leave the
//!   block the match is in

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::lexer::{tokenize, Language, Token, TokenKind};
use super::{Verdict, Verification, VerificationDetail, VerifyContext};
use crate::error::SandboxError;
use crate::sandbox::ExecutionResult;
use crate::task::{Expectation, PatternCheckSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternElement {
    Literal(String),
    Bind(String),
    Any,
    Ellipsis,
}

/// A compiled token pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPattern {
    elements: Vec<PatternElement>,
}

impl TokenPattern {
    /// Compiles `source` with the given language's lexical rules.
    ///
    /// Returns the reason when the pattern is unusable.
    pub fn compile(source: &str, language: Language) -> Result<Self, String> {
        let tokens = tokenize(source.as_bytes(), language);
        let mut elements = Vec::with_capacity(tokens.len());
        let mut iter = tokens.into_iter();

        while let Some(token) = iter.next() {
            if token.kind == TokenKind::Punct && token.is("$") {
                match iter.next() {
                    Some(name) if name.kind == TokenKind::Ident => {
                        if name.is("_") {
                            elements.push(PatternElement::Any);
                        } else {
                            elements.push(PatternElement::Bind(name.text));
                        }
                    }
                    _ => {
                        return Err(format!(
                            "'$' must be followed by a name in pattern '{source}'"
                        ))
                    }
                }
            } else if token.kind == TokenKind::Punct && token.is("...") {
                if elements.last() != Some(&PatternElement::Ellipsis) {
                    elements.push(PatternElement::Ellipsis);
                }
            } else {
                elements.push(PatternElement::Literal(token.text));
            }
        }

        if elements.iter().all(|e| *e == PatternElement::Ellipsis) {
            return Err(format!("pattern '{source}' has no tokens to match"));
        }
        Ok(Self { elements })
    }

    /// Finds the first match in `tokens`, returning its token range.
    pub fn find(&self, tokens: &[Token]) -> Option<std::ops::Range<usize>> {
        (0..tokens.len()).find_map(|start| {
            let mut bindings = HashMap::new();
            self.match_at(0, tokens, start, 0, &mut bindings)
                .map(|end| start..end)
        })
    }

    fn match_at<'p, 't>(
        &'p self,
        pi: usize,
        tokens: &'t [Token],
        ti: usize,
        depth: usize,
        bindings: &mut HashMap<&'p str, &'t str>,
    ) -> Option<usize> {
        let Some(element) = self.elements.get(pi) else {
            return Some(ti);
        };

        if *element == PatternElement::Ellipsis {
            let mut depth = depth;
            let mut at = ti;
            loop {
                let mut attempt = bindings.clone();
                if let Some(end) = self.match_at(pi + 1, tokens, at, depth, &mut attempt) {
                    *bindings = attempt;
                    return Some(end);
                }
                let token = tokens.get(at)?;
                depth = step_depth(token, depth)?;
                at += 1;
            }
        }

        let token = tokens.get(ti)?;
        match element {
            PatternElement::Literal(text) if token.text == *text => {}
            PatternElement::Any => {}
            PatternElement::Bind(name) => match bindings.get(name.as_str()) {
                Some(prev) if *prev != token.text => return None,
                Some(_) => {}
                None => {
                    bindings.insert(name.as_str(), token.text.as_str());
                }
            },
            _ => return None,
        }
        // Explicit tokens may close an outer block; only `...` is bounded.
        let depth = step_depth(token, depth).unwrap_or(0);
        self.match_at(pi + 1, tokens, ti + 1, depth, bindings)
    }
}

/// Tracks bracket nesting; `None` when `token` would close the enclosing block.
fn step_depth(token: &Token, depth: usize) -> Option<usize> {
    if token.kind != TokenKind::Punct {
        return Some(depth);
    }
    match token.text.as_str() {
        "{" | "(" | "[" => Some(depth + 1),
        "}" | ")" | "]" => depth.checked_sub(1),
        _ => Some(depth),
    }
}

/// Token range of a function body, if the function is defined in `tokens`.
pub fn function_body(
    tokens: &[Token],
    name: &str,
    language: Language,
) -> Option<std::ops::Range<usize>> {
    match language {
        Language::CLike => c_function_body(tokens, name),
        Language::Python => python_function_body(tokens, name),
    }
}

fn c_function_body(tokens: &[Token], name: &str) -> Option<std::ops::Range<usize>> {
    let mut i = 0;
    while i < tokens.len() {
        if tokens[i].kind == TokenKind::Ident
            && tokens[i].is(name)
            && tokens.get(i + 1).is_some_and(|t| t.is("("))
        {
            let after_params = matching_close(tokens, i + 1, "(", ")")?;
            let mut j = after_params + 1;
            // Skip qualifiers and attributes between `)` and `{`.
            while let Some(t) = tokens.get(j) {
                if t.is("{") || t.is(";") || t.is("=") || t.is(",") || t.is(")") {
                    break;
                }
                j += 1;
            }
            if tokens.get(j).is_some_and(|t| t.is("{")) {
                let close = matching_close(tokens, j, "{", "}")?;
                return Some(j + 1..close);
            }
            i = after_params;
        }
        i += 1;
    }
    None
}

fn python_function_body(tokens: &[Token], name: &str) -> Option<std::ops::Range<usize>> {
    let def = tokens.windows(2).position(|w| {
        w[0].is("def") && w[0].kind == TokenKind::Ident && w[1].is(name)
    })?;
    let def_indent = tokens[def].indent;
    let def_line = tokens[def].line;

    // The signature may span lines; the body starts after the first `:` at depth 0.
    let mut depth = 0usize;
    let mut colon = None;
    for (k, t) in tokens.iter().enumerate().skip(def + 2) {
        match t.text.as_str() {
            "(" | "[" | "{" => depth += 1,
            ")" | "]" | "}" => depth = depth.saturating_sub(1),
            ":" if depth == 0 => {
                colon = Some(k);
                break;
            }
            _ => {}
        }
    }
    let colon = colon?;
    let start = colon + 1;
    let colon_line = tokens[colon].line;

    let mut end = start;
    while let Some(t) = tokens.get(end) {
        let same_line_body = t.line == colon_line;
        if !same_line_body && t.line > def_line && t.indent <= def_indent {
            break;
        }
        end += 1;
    }
    Some(start..end)
}

fn matching_close(tokens: &[Token], open_at: usize, open: &str, close: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (k, t) in tokens.iter().enumerate().skip(open_at) {
        if t.kind != TokenKind::Punct {
            continue;
        }
        if t.is(open) {
            depth += 1;
        } else if t.is(close) {
            depth -= 1;
            if depth == 0 {
                return Some(k);
            }
        }
    }
    None
}

/// Result of one static check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    pub pattern: String,
    pub expect: Expectation,
    /// The pattern was found in scope.
    pub found: bool,
    pub satisfied: bool,
    /// 1-based line of the match, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    /// Why the check could not be evaluated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A check with its pattern compiled.
#[derive(Debug, Clone)]
pub struct CompiledCheck {
    spec: PatternCheckSpec,
    language: Language,
    pattern: TokenPattern,
}

impl CompiledCheck {
    pub fn compile(spec: &PatternCheckSpec) -> Result<Self, String> {
        let language = Language::from_path(&spec.file);
        let pattern = TokenPattern::compile(&spec.pattern, language)?;
        Ok(Self {
            spec: spec.clone(),
            language,
            pattern,
        })
    }

    pub fn file(&self) -> &str {
        &self.spec.file
    }

    /// Evaluates the check against the file's contents.
    ///
    /// A missing file or function fails the check whichever way it points.
    pub fn evaluate(&self, source: Option<&[u8]>) -> CheckOutcome {
        let mut outcome = CheckOutcome {
            file: self.spec.file.clone(),
            function: self.spec.function.clone(),
            pattern: self.spec.pattern.clone(),
            expect: self.spec.expect,
            found: false,
            satisfied: false,
            line: None,
            error: None,
        };

        let Some(source) = source else {
            outcome.error = Some(format!("file '{}' does not exist", self.spec.file));
            return outcome;
        };

        let tokens = tokenize(source, self.language);
        let scope = match &self.spec.function {
            Some(name) => match function_body(&tokens, name, self.language) {
                Some(range) => range,
                None => {
                    outcome.error = Some(format!(
                        "function '{name}' not found in '{}'",
                        self.spec.file
                    ));
                    return outcome;
                }
            },
            None => 0..tokens.len(),
        };

        let scoped = &tokens[scope];
        if let Some(range) = self.pattern.find(scoped) {
            outcome.found = true;
            outcome.line = scoped.get(range.start).map(|t| t.line);
        }
        outcome.satisfied = match self.spec.expect {
            Expectation::Present => outcome.found,
            Expectation::Absent => !outcome.found,
        };
        outcome
    }
}

/// Runs every check against the working tree; no process is started.
#[derive(Debug, Clone)]
pub struct StaticStrategy {
    checks: Vec<CompiledCheck>,
}

impl StaticStrategy {
    pub fn new(checks: Vec<CompiledCheck>) -> Self {
        Self { checks }
    }

    pub fn verify(&self, ctx: &VerifyContext<'_>) -> Result<Verification, SandboxError> {
        let mut outcomes = Vec::with_capacity(self.checks.len());
        for check in &self.checks {
            let source = match ctx.tree.read(check.file()) {
                Ok(bytes) => Some(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(SandboxError::Workspace(e)),
            };
            outcomes.push(check.evaluate(source.as_deref()));
        }

        let tests_pass = outcomes.iter().all(|o| o.satisfied);
        Ok(Verification {
            verdict: Verdict {
                tests_pass: Some(tests_pass),
                ..Verdict::default()
            },
            executions: vec![ExecutionResult::synthetic("static_pattern_check")],
            samples: 1,
            cancelled: false,
            detail: VerificationDetail::StaticPatternCheck { checks: outcomes },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const C_SOURCE: &str = r#"
static int clamp(int v, int lo, int hi) {
    if (v < lo) return lo;
    if (v > hi) return hi;
    return v;
}

void update(struct figure *f) {
    // f->frame = f->frame + 1;
    if (f->frame >= MAX_FRAMES) {
        f->frame = 0;
    }
    f->x = clamp(f->x, 0, 100);
}
"#;

    fn find(pattern: &str, source: &str) -> bool {
        let tokens = tokenize(source.as_bytes(), Language::CLike);
        TokenPattern::compile(pattern, Language::CLike)
            .expect("compile")
            .find(&tokens)
            .is_some()
    }

    fn check(
        file: &str,
        function: Option<&str>,
        pattern: &str,
        expect: Expectation,
    ) -> CompiledCheck {
        CompiledCheck::compile(&PatternCheckSpec {
            file: file.to_string(),
            function: function.map(str::to_string),
            pattern: pattern.to_string(),
            expect,
            description: None,
        })
        .expect("compile")
    }

    #[test]
    fn test_literal_match_ignores_whitespace_and_comments() {
        assert!(find("if ( f -> frame >= MAX_FRAMES )", C_SOURCE));
        assert!(find("if(f->frame>=MAX_FRAMES)", C_SOURCE));
        // Only present inside a comment.
        assert!(!find("f->frame = f->frame + 1", C_SOURCE));
    }

    #[test]
    fn test_metavariables_bind_consistently() {
        assert!(find("$x->$f = clamp($x->$f, ...)", C_SOURCE));
        assert!(!find("$x->x = clamp($x->frame, ...)", C_SOURCE));
        assert!(find("if ($v < $lo) return $lo;", C_SOURCE));
        assert!(!find("if ($v < $lo) return $v;", C_SOURCE));
    }

    #[test]
    fn test_any_token_wildcard() {
        assert!(find("if ($_ > $_) return $_ ;", C_SOURCE));
    }

    #[test]
    fn test_ellipsis_stays_inside_block() {
        assert!(find("if (f->frame >= MAX_FRAMES) { ... = 0; }", C_SOURCE));
        // Would have to cross the closing brace of clamp().
        assert!(!find("return v; ... void update", C_SOURCE));
    }

    #[test]
    fn test_function_scope() {
        let c = check("src/figure.c", Some("clamp"), "f->frame", Expectation::Absent);
        let outcome = c.evaluate(Some(C_SOURCE.as_bytes()));
        assert!(outcome.satisfied);
        assert!(!outcome.found);

        let c = check("src/figure.c", Some("update"), "f->frame = 0;", Expectation::Present);
        let outcome = c.evaluate(Some(C_SOURCE.as_bytes()));
        assert!(outcome.satisfied);
        assert_eq!(outcome.line, Some(11));
    }

    #[test]
    fn test_missing_function_or_file_fails() {
        let c = check("src/figure.c", Some("render"), "x", Expectation::Absent);
        let outcome = c.evaluate(Some(C_SOURCE.as_bytes()));
        assert!(!outcome.satisfied);
        assert!(outcome.error.is_some());

        let outcome = c.evaluate(None);
        assert!(!outcome.satisfied);
    }

    #[test]
    fn test_python_function_scope() {
        let src = "class Ball:\n    def bounce(self):\n        self.vy = -self.vy\n        return self\n\n    def stop(self):\n        self.vy = 0\n";
        let c = check("game/ball.py", Some("bounce"), "self.$a = -self.$a", Expectation::Present);
        assert!(c.evaluate(Some(src.as_bytes())).satisfied);

        let c = check("game/ball.py", Some("bounce"), "self.vy = 0", Expectation::Absent);
        assert!(c.evaluate(Some(src.as_bytes())).satisfied);
    }

    #[test]
    fn test_pattern_compile_errors() {
        assert!(TokenPattern::compile("...", Language::CLike).is_err());
        assert!(TokenPattern::compile("$ 1", Language::CLike).is_err());
    }

    #[test]
    fn test_strategy_reads_working_tree() {
        use crate::sandbox::ResourceLimits;
        use crate::verification::testing::CannedExecutor;
        use crate::workspace::WorkingTree;
        use std::collections::BTreeSet;
        use tokio_util::sync::CancellationToken;

        let files = [("src/figure.c".to_string(), C_SOURCE.as_bytes().to_vec())]
            .into_iter()
            .collect();
        let tree = WorkingTree::materialize("static", files, &Default::default(), &BTreeSet::new())
            .expect("tree");
        let executor = CannedExecutor::new(&[]);
        let cancel = CancellationToken::new();
        let ctx = VerifyContext {
            tree: &tree,
            executor: &executor,
            limits: ResourceLimits::default(),
            cancel: &cancel,
        };
        let strategy = StaticStrategy::new(vec![
            check("src/figure.c", Some("update"), "$x->frame >= MAX_FRAMES", Expectation::Present),
            check("src/figure.c", None, "f->frame > MAX_FRAMES", Expectation::Absent),
        ]);

        let verification = strategy.verify(&ctx).expect("verify");
        assert_eq!(verification.verdict.tests_pass, Some(true));
        assert_eq!(verification.executions.len(), 1);
        assert_eq!(verification.executions[0].duration, std::time::Duration::ZERO);
        assert!(executor.scripts().is_empty());
    }
}
