//! Core record model, cell normalization and merge rules for tabsync.

use serde::{Deserialize, Deserializer, Serialize};

pub const CRATE_NAME: &str = "tabsync-core";

/// One row of the merged table. `id` stays text so leading zeros survive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    #[serde(deserialize_with = "text_required")]
    pub id: String,
    #[serde(deserialize_with = "text_required")]
    pub name: String,
    #[serde(default, deserialize_with = "text_optional")]
    pub description: Option<String>,
}

impl Record {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: Option<impl Into<String>>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.map(Into::into),
        }
    }

    /// Apply [`normalize_cell`] to every present field.
    pub fn normalized(self) -> Self {
        Self {
            id: normalize_cell(&self.id),
            name: normalize_cell(&self.name),
            description: self.description.as_deref().map(normalize_cell),
        }
    }
}

/// Scalar JSON values accepted where text is expected.
#[derive(Deserialize)]
#[serde(untagged)]
enum TextLike {
    Text(String),
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    Bool(bool),
}

impl From<TextLike> for String {
    fn from(value: TextLike) -> Self {
        match value {
            TextLike::Text(s) => s,
            TextLike::Signed(n) => n.to_string(),
            TextLike::Unsigned(n) => n.to_string(),
            TextLike::Float(n) => n.to_string(),
            TextLike::Bool(b) => b.to_string(),
        }
    }
}

fn text_required<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    TextLike::deserialize(deserializer).map(String::from)
}

fn text_optional<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<TextLike>::deserialize(deserializer)?.map(String::from))
}

/// Trim surrounding whitespace and drop every literal `"`.
///
/// Trims a second time after quote removal so `" x "` ends up as `x`, which keeps
/// the function idempotent.
pub fn normalize_cell(raw: &str) -> String {
    raw.trim().replace('"', "").trim().to_string()
}

/// Concatenate both sources, normalize every cell and stable-sort by `name`.
///
/// Rows from `first` precede rows from `second` when names are equal.
pub fn merge_tables(first: Vec<Record>, second: Vec<Record>) -> Vec<Record> {
    let mut merged = first
        .into_iter()
        .chain(second)
        .map(Record::normalized)
        .collect::<Vec<_>>();
    merged.sort_by(|a, b| a.name.cmp(&b.name));
    merged
}

pub const NULL_DISPLAY: &str = "NULL";

/// Render rows as an aligned plain-text table with a leading row index.
pub fn render_table(rows: &[Record]) -> String {
    let header = ["", "id", "name", "description"];
    let body = rows
        .iter()
        .enumerate()
        .map(|(idx, r)| {
            [
                idx.to_string(),
                r.id.clone(),
                r.name.clone(),
                r.description
                    .clone()
                    .unwrap_or_else(|| NULL_DISPLAY.to_string()),
            ]
        })
        .collect::<Vec<_>>();

    let mut widths = header.map(|h| h.chars().count());
    for row in &body {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let format_line = |cells: [&str; 4]| {
        cells
            .iter()
            .zip(widths.iter())
            .map(|(cell, width)| {
                let pad = width - cell.chars().count();
                format!("{}{cell}", " ".repeat(pad))
            })
            .collect::<Vec<_>>()
            .join("  ")
    };

    let mut lines = Vec::with_capacity(body.len() + 1);
    if rows.is_empty() {
        lines.push("(empty table)".to_string());
    } else {
        lines.push(format_line(header));
        for row in &body {
            lines.push(format_line([&row[0], &row[1], &row[2], &row[3]]));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_padded_cell_normalizes_to_bare_text() {
        assert_eq!(normalize_cell("  \"Carol\"  "), "Carol");
        assert_eq!(normalize_cell("\" spaced \""), "spaced");
        assert_eq!(normalize_cell("say \"hi\" now"), "say hi now");
        assert_eq!(normalize_cell(" \t "), "");
    }

    #[test]
    fn normalization_is_idempotent() {
        let inputs = [
            "  \"Carol\"  ",
            "\" x \"",
            "plain",
            "",
            "Тест \"кавычки\" ",
            "\"\"",
        ];
        for raw in inputs {
            let once = normalize_cell(raw);
            assert_eq!(normalize_cell(&once), once, "input {raw:?}");
            assert_eq!(once.trim(), once);
            assert!(!once.contains('"'));
        }
    }

    #[test]
    fn merge_orders_by_name_and_keeps_missing_description() {
        let a = vec![Record::new("001", "Alice", Some("desc1"))];
        let b = vec![Record::new("002", "Bob", None::<String>)];

        let merged = merge_tables(a, b);

        assert_eq!(
            merged,
            vec![
                Record::new("001", "Alice", Some("desc1")),
                Record::new("002", "Bob", None::<String>),
            ]
        );
    }

    #[test]
    fn merge_sorts_after_normalizing() {
        let a = vec![
            Record::new(" 010 ", "  \"Zed\"", Some(" z ")),
            Record::new("011", "Mia", Some("\"m\"")),
        ];
        let b = vec![Record::new("012", " Abe", None::<String>)];

        let merged = merge_tables(a, b);
        let names = merged.iter().map(|r| r.name.as_str()).collect::<Vec<_>>();

        assert_eq!(names, vec!["Abe", "Mia", "Zed"]);
        assert_eq!(merged[2].id, "010");
        assert_eq!(merged[2].description.as_deref(), Some("z"));
        assert_eq!(merged[1].description.as_deref(), Some("m"));
    }

    #[test]
    fn equal_names_keep_first_source_ahead() {
        let a = vec![
            Record::new("a1", "Same", Some("from a")),
            Record::new("a2", "Other", Some("from a")),
            Record::new("a3", "Same", Some("from a again")),
        ];
        let b = vec![
            Record::new("b1", "Same", None::<String>),
            Record::new("b2", "\"Same\"", None::<String>),
        ];

        let merged = merge_tables(a, b);
        let ids = merged.iter().map(|r| r.id.as_str()).collect::<Vec<_>>();

        assert_eq!(ids, vec!["a2", "a1", "a3", "b1", "b2"]);
    }

    #[test]
    fn merge_is_deterministic() {
        let a = vec![
            Record::new("3", "c", Some("x")),
            Record::new("1", "a", Some("y")),
        ];
        let b = vec![Record::new("2", "b", None::<String>)];
        assert_eq!(
            merge_tables(a.clone(), b.clone()),
            merge_tables(a, b)
        );
    }

    #[test]
    fn deserializes_numbers_and_nulls_as_text() {
        let rows: Vec<Record> = serde_json::from_str(
            r#"[
                {"id": "007", "name": "Bond", "description": null},
                {"id": 42, "name": "Answer", "description": 1.5},
                {"id": "9", "name": true}
            ]"#,
        )
        .expect("parse");

        assert_eq!(rows[0], Record::new("007", "Bond", None::<String>));
        assert_eq!(rows[1], Record::new("42", "Answer", Some("1.5")));
        assert_eq!(rows[2], Record::new("9", "true", None::<String>));
    }

    #[test]
    fn serializes_keys_in_column_order() {
        let json = serde_json::to_string(&Record::new("001", "Алиса", None::<String>))
            .expect("serialize");
        assert_eq!(json, r#"{"id":"001","name":"Алиса","description":null}"#);
    }

    #[test]
    fn render_table_aligns_columns_and_marks_nulls() {
        let rendered = render_table(&[
            Record::new("001", "Alice", Some("desc1")),
            Record::new("002", "Борис", None::<String>),
        ]);
        let lines = rendered.lines().collect::<Vec<_>>();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "    id   name  description");
        assert_eq!(lines[1], "0  001  Alice        desc1");
        assert_eq!(lines[2], "1  002  Борис         NULL");
        assert_eq!(render_table(&[]), "(empty table)");
    }
}
