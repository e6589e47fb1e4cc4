//! Row projection onto named columns, with optional markup stripping.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::schema::Row;

static SCRIPT_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").expect("static regex"));
static HTML_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*>").expect("static regex"));
static JS_URI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)javascript\s*:").expect("static regex"));
static EVENT_HANDLER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)on\w+\s*=").expect("static regex"));

/// Strip script blocks, remaining tags, `javascript:` URIs and inline
/// event-handler attributes from a string.
///
/// Passes repeat until nothing matches, since removing one match can join
/// its neighbours into a new one (`javajavascript:script:`).
pub fn sanitize_str(input: &str) -> String {
    let mut current = input.to_string();
    loop {
        let next = strip_once(&current);
        // Every pass only removes text, so this terminates.
        if next.len() == current.len() {
            return next;
        }
        current = next;
    }
}

fn strip_once(input: &str) -> String {
    let without_scripts = SCRIPT_BLOCK.replace_all(input, "");
    let without_tags = HTML_TAG.replace_all(&without_scripts, "");
    let without_uris = JS_URI.replace_all(&without_tags, "");
    EVENT_HANDLER.replace_all(&without_uris, "").into_owned()
}

/// Sanitize string cells; other cell types pass through.
pub fn sanitize_value(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(sanitize_str(&s)),
        other => other,
    }
}

/// Zip the first `preview_count` rows against `columns`.
///
/// Missing trailing cells become empty strings; cells past the last column are dropped.
pub fn project(
    rows: &[Vec<Value>],
    columns: &[String],
    preview_count: usize,
    sanitize: bool,
) -> Vec<Row> {
    rows.iter()
        .take(preview_count)
        .map(|raw| {
            let mut row = Row::new();
            for (idx, column) in columns.iter().enumerate() {
                let cell = raw
                    .get(idx)
                    .cloned()
                    .unwrap_or_else(|| Value::String(String::new()));
                let cell = if sanitize { sanitize_value(cell) } else { cell };
                row.insert(column.clone(), cell);
            }
            row
        })
        .collect()
}

/// Rough byte footprint of projected rows: key and string lengths plus
/// eight bytes per scalar.
pub fn estimate_memory(rows: &[Row]) -> u64 {
    rows.iter()
        .flat_map(|row| row.iter())
        .map(|(key, value)| {
            let value_size = match value {
                Value::String(s) => s.len(),
                _ => 8,
            };
            (key.len() + value_size) as u64
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn columns() -> Vec<String> {
        vec!["Name".to_string(), "Age".to_string(), "Email".to_string()]
    }

    #[test]
    fn test_script_block_removed_text_kept() {
        assert_eq!(
            sanitize_str("Hello <script>alert('x')</script>World"),
            "Hello World"
        );
        assert_eq!(
            sanitize_str("a<SCRIPT type=\"text/javascript\">\nsteal()\n</Script >b"),
            "ab"
        );
    }

    #[test]
    fn test_tags_uris_and_handlers_removed() {
        assert_eq!(sanitize_str("<b>bold</b> text"), "bold text");
        assert_eq!(sanitize_str("javascript:alert(1)"), "alert(1)");
        assert_eq!(sanitize_str("x onclick=run() y"), "x run() y");
        assert_eq!(sanitize_str("plain text"), "plain text");
    }

    #[test]
    fn test_nested_uris_do_not_reassemble() {
        let cleaned = sanitize_str("javajavascript:script:alert(1)");
        assert!(!cleaned.to_lowercase().contains("javascript:"));
        assert_eq!(cleaned, "alert(1)");

        assert_eq!(sanitize_str("<<b>script>x"), "script>x");
    }

    #[test]
    fn test_handlers_inside_words_removed() {
        assert_eq!(sanitize_str("x oonclick=nclick=evil()"), "x evil()");
        assert_eq!(sanitize_str("aONLOAD =go()"), "ago()");
        assert!(!sanitize_str("<img src=x oonerror=nerror=alert(1)>y").contains("onerror"));
    }

    #[test]
    fn test_non_strings_pass_through() {
        assert_eq!(sanitize_value(json!(25)), json!(25));
        assert_eq!(sanitize_value(json!(true)), json!(true));
    }

    #[test]
    fn test_project_fills_missing_cells() {
        let rows = vec![
            vec![json!("John"), json!(25), json!("john@x.com")],
            vec![json!("Bob")],
        ];
        let projected = project(&rows, &columns(), 5, false);
        assert_eq!(
            serde_json::to_value(&projected).unwrap(),
            json!([
                {"Name": "John", "Age": 25, "Email": "john@x.com"},
                {"Name": "Bob", "Age": "", "Email": ""}
            ])
        );
    }

    #[test]
    fn test_project_preserves_column_order() {
        let rows = vec![vec![json!(1), json!(2), json!(3)]];
        let projected = project(&rows, &columns(), 5, false);
        let keys: Vec<&String> = projected[0].keys().collect();
        assert_eq!(keys, vec!["Name", "Age", "Email"]);
    }

    #[test]
    fn test_project_truncates_to_preview() {
        let rows: Vec<Vec<Value>> = (0..20).map(|i| vec![json!(i)]).collect();
        let projected = project(&rows, &columns(), 5, true);
        assert_eq!(projected.len(), 5);
        assert_eq!(projected[4]["Name"], json!(4));
    }

    #[test]
    fn test_project_sanitizes_when_enabled() {
        let rows = vec![vec![json!("Eve<script>x()</script>")]];
        assert_eq!(project(&rows, &columns(), 5, true)[0]["Name"], json!("Eve"));
        assert_eq!(
            project(&rows, &columns(), 5, false)[0]["Name"],
            json!("Eve<script>x()</script>")
        );
    }

    #[test]
    fn test_estimate_memory() {
        let rows = project(&[vec![json!("ab"), json!(1)]], &columns(), 5, false);
        // Name+ab, Age+8, Email+""
        assert_eq!(estimate_memory(&rows), 6 + 11 + 5);
    }
}
