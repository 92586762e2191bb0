//! Human-readable rendering of a table with head/tail and first/last truncation.

use crate::error::Result;
use crate::table::{any_value_to_json, Table};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const ELLIPSIS: &str = "...";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayOptions {
    pub head_rows: usize,
    pub tail_rows: usize,
    pub first_cols: usize,
    pub last_cols: usize,
    /// Ignore the four limits above and print everything.
    pub display_all: bool,
}

impl Default for DisplayOptions {
    fn default() -> Self {
        Self {
            head_rows: 5,
            tail_rows: 5,
            first_cols: 3,
            last_cols: 3,
            display_all: false,
        }
    }
}

/// Indices to show; `None` marks the elided gap.
fn visible(total: usize, head: usize, tail: usize, all: bool) -> Vec<Option<usize>> {
    if all || total <= head.saturating_add(tail) {
        return (0..total).map(Some).collect();
    }
    let (head, tail) = (head.min(total), tail.min(total));
    let mut out: Vec<Option<usize>> = (0..head).map(Some).collect();
    out.push(None);
    out.extend((total - tail..total).map(Some));
    out
}

fn cell_text(value: Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::String(s) => s,
        other => other.to_string(),
    }
}

pub fn format_table(table: &Table, opts: &DisplayOptions) -> Result<String> {
    let names = table.column_names();
    let rows = visible(table.num_rows(), opts.head_rows, opts.tail_rows, opts.display_all);
    let cols = visible(names.len(), opts.first_cols, opts.last_cols, opts.display_all);

    let mut grid: Vec<Vec<String>> = Vec::with_capacity(rows.len() + 1);
    grid.push(
        cols.iter()
            .map(|c| match c {
                Some(i) => names[*i].clone(),
                None => ELLIPSIS.to_string(),
            })
            .collect(),
    );
    for row in &rows {
        let mut line = Vec::with_capacity(cols.len());
        for c in &cols {
            let text = match (row, c) {
                (Some(r), Some(i)) => {
                    let column = table.frame().column(names[*i].as_str())?;
                    cell_text(any_value_to_json(&column.get(*r)?))
                }
                _ => ELLIPSIS.to_string(),
            };
            line.push(text);
        }
        grid.push(line);
    }

    let widths: Vec<usize> = (0..cols.len())
        .map(|c| grid.iter().map(|line| line[c].chars().count()).max().unwrap_or(0))
        .collect();

    let mut out = String::new();
    for (i, line) in grid.iter().enumerate() {
        let padded: Vec<String> = line
            .iter()
            .zip(&widths)
            .map(|(text, w)| format!("{:<width$}", text, width = *w))
            .collect();
        out.push_str(padded.join(" | ").trim_end());
        out.push('\n');
        if i == 0 {
            let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
            out.push_str(&rule.join("-+-"));
            out.push('\n');
        }
    }
    out.push_str(&format!(
        "[{} rows x {} columns]",
        table.num_rows(),
        table.num_cols()
    ));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::prelude::*;

    fn wide_table(rows: i64) -> Table {
        let columns: Vec<Column> = (0..8)
            .map(|c| {
                Column::new(
                    format!("c{}", c).into(),
                    (0..rows).map(|r| r * 10 + c).collect::<Vec<i64>>(),
                )
            })
            .collect();
        Table::new(DataFrame::new(columns).unwrap())
    }

    #[test]
    fn test_truncates_rows_and_columns() {
        let text = format_table(&wide_table(20), &DisplayOptions::default()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        // header, rule, 5 head, gap, 5 tail, footer
        assert_eq!(lines.len(), 14);
        let header: Vec<&str> = lines[0].split('|').map(str::trim).collect();
        assert_eq!(header, ["c0", "c1", "c2", "...", "c5", "c6", "c7"]);
        assert!(lines[7].starts_with("..."));
        assert!(lines[8].starts_with("150"));
        assert_eq!(lines[13], "[20 rows x 8 columns]");
    }

    #[test]
    fn test_display_all() {
        let opts = DisplayOptions {
            display_all: true,
            ..Default::default()
        };
        let text = format_table(&wide_table(12), &opts).unwrap();
        assert_eq!(text.lines().count(), 12 + 3);
        assert!(!text.contains("..."));
    }

    #[test]
    fn test_small_table_not_truncated() {
        let text = format_table(&wide_table(3), &DisplayOptions::default()).unwrap();
        assert!(text.lines().nth(2).unwrap().contains(" | ... | "));
        assert_eq!(text.lines().count(), 3 + 3);
    }

    #[test]
    fn test_huge_limits_show_everything() {
        let opts = DisplayOptions {
            head_rows: usize::MAX,
            tail_rows: 5,
            first_cols: 2,
            last_cols: usize::MAX,
            display_all: false,
        };
        let text = format_table(&wide_table(5), &opts).unwrap();
        assert_eq!(text.lines().count(), 5 + 3);
        assert!(!text.contains("..."));
        assert_eq!(visible(4, usize::MAX, usize::MAX, false).len(), 4);
    }
}
