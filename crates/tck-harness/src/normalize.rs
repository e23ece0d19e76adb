//! Dialect-neutral normalization of SQL text.
//!
//! Captured and expected SQL are both passed through [`normalize_sql`] before
//! comparison, so identifier quoting, `AS` aliasing and line endings do not
//! cause false mismatches across databases.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

static ALIAS_KEYWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\sas\s").expect("alias keyword pattern is valid"));

/// Unify `\r\n` and lone `\r` to `\n`.
pub fn clean_line_endings(sql: &str) -> Cow<'_, str> {
    if sql.contains('\r') {
        Cow::Owned(sql.replace("\r\n", "\n").replace('\r', "\n"))
    } else {
        Cow::Borrowed(sql)
    }
}

/// Remove every occurrence of the identifier quote string.
pub fn strip_quotes<'a>(sql: &'a str, quote: &str) -> Cow<'a, str> {
    if quote.is_empty() || !sql.contains(quote) {
        Cow::Borrowed(sql)
    } else {
        Cow::Owned(sql.replace(quote, ""))
    }
}

/// Drop the `as` alias keyword when it stands between whitespace.
pub fn strip_alias_keyword(sql: &str) -> Cow<'_, str> {
    ALIAS_KEYWORD.replace_all(sql, " ")
}

/// Full normalization pipeline: line endings, quotes, alias keyword.
pub fn normalize_sql(sql: &str, quote: &str) -> String {
    let sql = clean_line_endings(sql);
    let sql = strip_quotes(&sql, quote);
    strip_alias_keyword(&sql).into_owned()
}

/// Whether `fragment` appears in `captured` once both are normalized.
///
/// Containment ignores ASCII case: drivers differ in keyword casing.
pub fn fragment_matches(fragment: &str, captured: &str, quote: &str) -> bool {
    let needle = normalize_sql(fragment, quote).to_ascii_lowercase();
    normalize_sql(captured, quote)
        .to_ascii_lowercase()
        .contains(&needle)
}

/// Expected fragments not found in any captured statement, in input order.
pub fn missing_fragments<'a>(
    expected: &'a [String],
    captured: &[String],
    quote: &str,
) -> Vec<&'a str> {
    let haystacks: Vec<String> = captured
        .iter()
        .map(|c| normalize_sql(c, quote).to_ascii_lowercase())
        .collect();
    expected
        .iter()
        .filter(|fragment| {
            let needle = normalize_sql(fragment, quote).to_ascii_lowercase();
            !haystacks.iter().any(|h| h.contains(&needle))
        })
        .map(String::as_str)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_endings_are_unified() {
        assert_eq!(clean_line_endings("a\r\nb\rc\n"), "a\nb\nc\n");
        assert!(matches!(clean_line_endings("plain"), Cow::Borrowed(_)));
    }

    #[test]
    fn quotes_are_stripped() {
        assert_eq!(strip_quotes("select \"a\" from \"t\"", "\""), "select a from t");
        assert_eq!(strip_quotes("select `a`", "`"), "select a");
        assert_eq!(strip_quotes("select \"a\"", ""), "select \"a\"");
    }

    #[test]
    fn alias_keyword_needs_surrounding_whitespace() {
        assert_eq!(strip_alias_keyword("sum(x) as m0"), "sum(x) m0");
        assert_eq!(strip_alias_keyword("sum(x)\nAS\nm0"), "sum(x) m0");
        assert_eq!(strip_alias_keyword("select base, alias from t"), "select base, alias from t");
        assert_eq!(strip_alias_keyword("cast(x as int)"), "cast(x int)");
    }

    #[test]
    fn mixed_case_capture_matches() {
        assert!(fragment_matches("sum(x) as m0", "SUM(x) AS m0\r\n", "\""));
        assert!(fragment_matches(
            "select\n    \"store\".\"store_name\" as \"c0\"",
            "SELECT\r\n    store.store_name c0\r\nFROM store",
            "\""
        ));
        assert!(!fragment_matches("sum(y)", "SUM(x) AS m0", "\""));
    }

    #[test]
    fn missing_fragments_preserve_order() {
        let expected = vec!["from t".to_owned(), "where z".to_owned(), "group by q".to_owned()];
        let captured = vec!["SELECT a FROM t".to_owned(), "select b from u group by q".to_owned()];
        assert_eq!(missing_fragments(&expected, &captured, "\""), vec!["where z"]);
        assert_eq!(missing_fragments(&expected, &[], "\"").len(), 3);
        assert!(missing_fragments(&[], &captured, "\"").is_empty());
    }
}
