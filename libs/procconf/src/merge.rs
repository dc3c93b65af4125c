//! Baseline merge.
//!
//! Folds a [`ConfMap`] of overrides into the line stream of a pristine
//! baseline. Rules:
//!
//! - A property line whose key has an override is rewritten to
//!   `key value`; the override is consumed.
//! - Overrides left over when a section ends are appended as new lines,
//!   before the blank lines separating it from the next section.
//! - Sections only present in the override map are appended at the end,
//!   each preceded by one blank line.
//! - Comments, blank lines, and unmatched lines pass through verbatim,
//!   so an empty override map reproduces the baseline exactly.

use std::io::{self, BufRead};
use std::sync::LazyLock;

use regex::Regex;

use crate::types::ConfMap;

static SECTION_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[(.*)\]$").expect("static section pattern"));

/// Returns the section name when the line is a `[section]` header.
pub fn section_header(line: &str) -> Option<&str> {
    SECTION_HEADER
        .captures(line)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str())
}

/// Merge `overrides` into the baseline read from `source`.
///
/// Returns the merged content as lines without terminators; writers emit
/// each line followed by `\n`.
pub fn merge_lines<R: BufRead>(source: R, overrides: &ConfMap) -> io::Result<Vec<String>> {
    let mut remaining = overrides.clone();
    let mut out = Vec::new();
    // Blank runs are held back so section leftovers land before the
    // separator, not after it.
    let mut blanks: Vec<String> = Vec::new();
    let mut current_section = String::new();

    for line in source.lines() {
        let line = line?;
        if line.trim().is_empty() {
            blanks.push(line);
            continue;
        }
        if let Some(header) = section_header(&line) {
            flush_section_leftovers(&current_section, &mut remaining, &mut out);
            out.append(&mut blanks);
            current_section = header.to_string();
            out.push(line);
        } else if line.starts_with('#') {
            out.append(&mut blanks);
            out.push(line);
        } else {
            out.append(&mut blanks);
            out.push(merge_line(line, &current_section, &mut remaining));
        }
    }

    flush_section_leftovers(&current_section, &mut remaining, &mut out);
    out.append(&mut blanks);

    // Sections the baseline never mentioned.
    for (section, props) in remaining {
        if props.is_empty() {
            continue;
        }
        out.push(String::new());
        out.push(format!("[{section}]"));
        for (key, value) in props {
            out.push(format!("{key} {value}"));
        }
    }

    Ok(out)
}

fn flush_section_leftovers(section: &str, remaining: &mut ConfMap, out: &mut Vec<String>) {
    if section.is_empty() {
        return;
    }
    if let Some(props) = remaining.remove(section) {
        for (key, value) in props {
            out.push(format!("{key} {value}"));
        }
    }
}

fn merge_line(line: String, section: &str, remaining: &mut ConfMap) -> String {
    let key = match line.split_whitespace().next() {
        Some(key) => key.to_string(),
        None => return line,
    };
    let Some(props) = remaining.get_mut(section) else {
        return line;
    };
    match props.remove(&key) {
        Some(value) => format!("{key} {value}"),
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::io::Cursor;

    use rstest::rstest;

    use super::*;

    fn overrides(entries: &[(&str, &str, &str)]) -> ConfMap {
        let mut map = ConfMap::new();
        for (section, key, value) in entries {
            map.entry(section.to_string())
                .or_insert_with(BTreeMap::new)
                .insert(key.to_string(), value.to_string());
        }
        map
    }

    fn merge(baseline: &str, map: &ConfMap) -> Vec<String> {
        merge_lines(Cursor::new(baseline.to_string()), map).unwrap()
    }

    #[rstest]
    #[case("[general]", Some("general"))]
    #[case("[agentType]", Some("agentType"))]
    #[case("[]", Some(""))]
    #[case("key [not] header", None)]
    #[case("plain line", None)]
    fn test_section_header_detection(#[case] line: &str, #[case] expected: Option<&str>) {
        assert_eq!(section_header(line), expected);
    }

    #[test]
    fn test_empty_overrides_reproduce_baseline() {
        let baseline = "[general]\nprop1 old\n\n# note\n[other]\nprop3 old\n";
        let merged = merge(baseline, &ConfMap::new());
        assert_eq!(merged.join("\n") + "\n", baseline);
    }

    #[test]
    fn test_full_merge() {
        let baseline = "[general]\nprop1 old\n\n[other]\nprop3 old\n";
        let map = overrides(&[
            ("general", "prop1", "upd"),
            ("general", "prop2", "new"),
            ("other", "prop3", "upd"),
            ("other", "prop4", "new"),
            ("new", "prop5", "new"),
        ]);
        let expected = "\
[general]
prop1 upd
prop2 new

[other]
prop3 upd
prop4 new

[new]
prop5 new";
        assert_eq!(merge(baseline, &map).join("\n"), expected);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let baseline = "[general]\nprop1 old\n\n[other]\nprop3 old\n";
        let map = overrides(&[
            ("general", "prop1", "upd"),
            ("general", "prop2", "new"),
            ("new", "prop5", "new"),
        ]);
        let once = merge(baseline, &map).join("\n") + "\n";
        let twice = merge(&once, &map).join("\n") + "\n";
        assert_eq!(once, twice);
    }

    #[test]
    fn test_replacement_keeps_only_first_token_as_key() {
        let baseline = "[general]\nlibraryPath /old/path extra\n";
        let map = overrides(&[("general", "libraryPath", "/new/path")]);
        assert_eq!(
            merge(baseline, &map),
            vec!["[general]", "libraryPath /new/path"]
        );
    }

    #[test]
    fn test_comments_never_match_overrides() {
        let baseline = "[general]\n# prop1 is documented here\nprop1 old\n";
        let map = overrides(&[("general", "prop1", "upd")]);
        assert_eq!(
            merge(baseline, &map),
            vec!["[general]", "# prop1 is documented here", "prop1 upd"]
        );
    }

    #[test]
    fn test_leftovers_precede_closing_blank_run() {
        let baseline = "[general]\nprop1 old\n\n\n[other]\nprop3 old\n";
        let map = overrides(&[("general", "prop2", "new")]);
        assert_eq!(
            merge(baseline, &map),
            vec!["[general]", "prop1 old", "prop2 new", "", "", "[other]", "prop3 old"]
        );
    }

    #[test]
    fn test_same_key_in_other_section_untouched() {
        let baseline = "[general]\nenabled false\n\n[agentType]\nenabled false\n";
        let map = overrides(&[("agentType", "enabled", "true")]);
        assert_eq!(
            merge(baseline, &map),
            vec![
                "[general]",
                "enabled false",
                "",
                "[agentType]",
                "enabled true"
            ]
        );
    }

    #[test]
    fn test_lines_before_any_section_pass_through() {
        let baseline = "# preamble\n\n[general]\nprop1 old\n";
        let map = overrides(&[("general", "prop1", "upd")]);
        assert_eq!(
            merge(baseline, &map),
            vec!["# preamble", "", "[general]", "prop1 upd"]
        );
    }

    #[test]
    fn test_appended_sections_sorted() {
        let baseline = "[general]\nprop1 old\n";
        let map = overrides(&[("zeta", "z", "1"), ("alpha", "a", "1")]);
        assert_eq!(
            merge(baseline, &map),
            vec!["[general]", "prop1 old", "", "[alpha]", "a 1", "", "[zeta]", "z 1"]
        );
    }
}
