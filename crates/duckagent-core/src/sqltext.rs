//! Keyword-level inspection of SQL text. This is not a parser: it only looks
//! at whitespace and punctuation separated tokens.

const DESTRUCTIVE: &[&str] = &[
    "DROP", "DELETE", "TRUNCATE", "ALTER", "INSERT", "UPDATE", "CREATE", "REPLACE", "GRANT",
];

/// Upper-cased tokens with quotes stripped. `schema.table` stays one token.
pub fn tokens(sql: &str) -> Vec<String> {
    sql.split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '.' || c == '"' || c == '`'))
        .map(|t| t.trim_matches(|c| c == '"' || c == '`'))
        .filter(|t| !t.is_empty())
        .map(str::to_uppercase)
        .collect()
}

/// Blank out `'...'` string literals (with `''` escapes) and `"..."` quoted
/// identifiers so their contents are never read as keywords.
fn mask_quoted(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\'' && c != '"' {
            out.push(c);
            continue;
        }
        loop {
            match chars.next() {
                Some(q) if q == c => {
                    if chars.peek() == Some(&c) {
                        chars.next();
                    } else {
                        break;
                    }
                }
                Some(_) => {}
                None => break,
            }
        }
        out.push_str(" _ ");
    }
    out
}

/// Bare words of the statement with whether each is directly followed by `(`.
fn words(sql: &str) -> Vec<(String, bool)> {
    let masked = mask_quoted(sql);
    let chars: Vec<char> = masked.chars().collect();
    let mut words = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if !(chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
            i += 1;
            continue;
        }
        let start = i;
        while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
            i += 1;
        }
        let word: String = chars[start..i].iter().collect::<String>().to_uppercase();
        let call = chars[i..]
            .iter()
            .find(|c| !c.is_whitespace())
            .is_some_and(|c| *c == '(');
        words.push((word, call));
    }
    words
}

/// First destructive keyword used as a statement keyword, if any.
///
/// Words inside string literals or quoted identifiers never count, and a
/// keyword followed by `(` is a function call. `REPLACE` only counts as
/// `REPLACE INTO`; `CREATE OR REPLACE` is already caught by `CREATE`.
pub fn destructive_keyword(sql: &str) -> Option<&'static str> {
    let words = words(sql);
    words.iter().enumerate().find_map(|(i, (word, call))| {
        if *call {
            return None;
        }
        let keyword = DESTRUCTIVE.iter().find(|k| **k == word.as_str()).copied()?;
        if keyword == "REPLACE" {
            let next = words.get(i + 1).map(|(w, _)| w.as_str());
            return (next == Some("INTO")).then_some(keyword);
        }
        Some(keyword)
    })
}

pub fn has_limit(sql: &str) -> bool {
    let toks = tokens(sql);
    toks.windows(2)
        .any(|w| w[0] == "LIMIT" && w[1].chars().all(|c| c.is_ascii_digit()))
}

/// Append `LIMIT n` when the statement has none. A trailing semicolon is dropped.
pub fn ensure_limit(sql: &str, limit: u64) -> String {
    let trimmed = sql.trim().trim_end_matches(';').trim_end();
    if has_limit(trimmed) {
        trimmed.to_string()
    } else {
        format!("{trimmed} LIMIT {limit}")
    }
}

/// Whether more than one statement is present.
pub fn is_multi_statement(sql: &str) -> bool {
    mask_quoted(sql).trim().trim_end_matches(';').contains(';')
}

/// Table names following `FROM` or `JOIN`, lower-cased, in order of appearance.
pub fn referenced_tables(sql: &str) -> Vec<String> {
    let raw: Vec<&str> = sql
        .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '.' || c == '"' || c == '`' || c == '('))
        .filter(|t| !t.is_empty())
        .collect();
    let mut tables = Vec::new();
    for pair in raw.windows(2) {
        let kw = pair[0].to_uppercase();
        if (kw == "FROM" || kw == "JOIN") && !pair[1].starts_with('(') {
            let name = pair[1]
                .trim_matches(|c| c == '"' || c == '`')
                .to_lowercase();
            if !name.is_empty() && !tables.contains(&name) {
                tables.push(name);
            }
        }
    }
    tables
}

/// Strip a Markdown code fence from model output.
pub fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let body = rest.split_once('\n').map_or("", |(_, body)| body);
        return body.trim_end().trim_end_matches("```").trim().to_string();
    }
    trimmed.to_string()
}
