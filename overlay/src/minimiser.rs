//! Strips comments and docstrings from the preamble before it is
//! compressed, to minimise wire bytes.
//!
//! Line numbering is preserved (docstrings become blank lines rather than
//! being deleted outright) so tracebacks in the child still point at
//! sensible source lines. Results are memoised since the same handful of
//! preamble sources are minimised repeatedly across many connects.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;

static CACHE: Lazy<Mutex<HashMap<String, String>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Minimises `source`, caching by the exact input string.
pub fn minimize_source(source: &str) -> String {
    if let Some(cached) = CACHE.lock().get(source) {
        return cached.clone();
    }

    let minimised = minimize_uncached(source);
    CACHE
        .lock()
        .insert(source.to_string(), minimised.clone());
    minimised
}

fn minimize_uncached(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut at_block_start = true;

    for (index, line) in source.lines().enumerate() {
        let trimmed = line.trim_start();
        let preserve_comment = index < 2 && (trimmed.starts_with("#!") || trimmed.starts_with("# -*-"));

        if is_docstring_position(trimmed) && at_block_start {
            out.push('\n');
            at_block_start = false;
            continue;
        }

        if trimmed.starts_with('#') && !preserve_comment {
            // Blank the line but keep it, preserving line numbers.
            out.push('\n');
            continue;
        }

        out.push_str(line);
        out.push('\n');

        at_block_start = trimmed.is_empty()
            || trimmed.ends_with(':')
            || trimmed.starts_with("def ")
            || trimmed.starts_with("class ");
    }

    reindent(&out)
}

fn is_docstring_position(trimmed: &str) -> bool {
    (trimmed.starts_with("\"\"\"") || trimmed.starts_with("'''")) && trimmed.len() > 3
}

/// Collapses each level of leading whitespace to a single space, keeping
/// relative nesting intact.
fn reindent(source: &str) -> String {
    source
        .lines()
        .map(|line| {
            let indent = line.len() - line.trim_start().len();
            let levels = indent / 4;
            format!("{}{}", " ".repeat(levels), line.trim_start())
        })
        .collect::<Vec<_>>()
        .join("\n")
        + "\n"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_comments_but_keeps_hashbang() {
        let source = "#!/usr/bin/env python\n# a real comment\nx = 1\n";
        let minimised = minimize_source(source);
        assert!(minimised.contains("#!/usr/bin/env python"));
        assert!(!minimised.contains("a real comment"));
        assert_eq!(minimised.lines().count(), source.lines().count());
    }

    #[test]
    fn preserves_line_count() {
        let source = "def f():\n    \"\"\"docs\"\"\"\n    return 1\n";
        let minimised = minimize_source(source);
        assert_eq!(minimised.lines().count(), source.lines().count());
    }

    #[test]
    fn memoises_identical_input() {
        let source = "x = 1\n";
        let first = minimize_source(source);
        let second = minimize_source(source);
        assert_eq!(first, second);
    }
}
