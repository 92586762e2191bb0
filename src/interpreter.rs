//! Applies an action log to a table.
//!
//! The same function runs on the client for resident handles and on the
//! server for opened dataframes, so both paths produce identical results.

use crate::action::{Action, MapFunction, SortOrder};
use crate::error::{Error, Result};
use crate::expr::Expression;
use crate::table::{is_numeric, json_values_to_series, Table};
use polars::prelude::*;
use serde_json::Value;

/// Relation name the table is bound to inside SQL statements.
pub const SQL_TABLE_NAME: &str = "dataframe";

const MASK_COLUMN: &str = "__dacp_filter_mask";

/// Apply every node in order. A failure names the node that raised it.
pub fn apply(table: &Table, actions: &[Action]) -> Result<Table> {
    let mut current = table.clone();
    for (index, action) in actions.iter().enumerate() {
        current = apply_action(&current, action).map_err(|source| Error::Action {
            index,
            action: action.name().to_string(),
            source: Box::new(source),
        })?;
    }
    Ok(current)
}

pub fn apply_action(table: &Table, action: &Action) -> Result<Table> {
    match action {
        Action::Limit { count } => Ok(table.slice(0, *count)),
        Action::Slice { offset, length } => Ok(table.slice(*offset, length.unwrap_or(usize::MAX))),
        Action::Select { columns } => select(table, columns),
        Action::Filter { expression } => filter(table, expression),
        Action::Map {
            column,
            function,
            new_column_name,
        } => {
            let name = new_column_name
                .clone()
                .unwrap_or_else(|| format!("{}_mapped", column));
            map(table, column, function, &name)
        }
        Action::Sort { column, order } => sort(table, column, *order),
        Action::Sql { sql_str } => sql(table, sql_str),
    }
}

fn require_column(table: &Table, name: &str) -> Result<()> {
    if table.has_column(name) {
        Ok(())
    } else {
        Err(Error::NotFound(format!("column '{}' does not exist", name)))
    }
}

/// Output names for a projection. Repeats become `{name}_{n}` since a frame
/// cannot hold two columns with the same name.
fn projection_names(requested: &[String], existing: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(requested.len());
    for name in requested {
        if !out.contains(name) {
            out.push(name.clone());
            continue;
        }
        let mut n = 1;
        loop {
            let candidate = format!("{}_{}", name, n);
            if !out.contains(&candidate) && !requested.contains(&candidate) && !existing.contains(&candidate) {
                out.push(candidate);
                break;
            }
            n += 1;
        }
    }
    out
}

fn select(table: &Table, columns: &[String]) -> Result<Table> {
    for name in columns {
        require_column(table, name)?;
    }
    let names = projection_names(columns, &table.column_names());
    let exprs: Vec<Expr> = columns
        .iter()
        .zip(&names)
        .map(|(source, out)| {
            if source == out {
                col(source.as_str())
            } else {
                col(source.as_str()).alias(out.as_str())
            }
        })
        .collect();
    let frame = table.frame().clone().lazy().select(exprs).collect()?;
    Ok(table.replace_frame(frame))
}

fn filter(table: &Table, expression: &str) -> Result<Table> {
    let parsed = Expression::parse(expression)?;
    parsed.check_columns(&table.column_names())?;
    let predicate = parsed.to_polars(None)?;
    // NaN compares like null, so the mask is computed with NaN nulled out
    let nan_as_null: Vec<Expr> = table
        .frame()
        .get_columns()
        .iter()
        .filter(|c| c.dtype().is_float())
        .map(|c| col(c.name().as_str()).fill_nan(lit(Null {})))
        .collect();
    let mask = table
        .frame()
        .clone()
        .lazy()
        .with_columns(nan_as_null)
        .with_column(predicate.alias(MASK_COLUMN))
        .select([col(MASK_COLUMN)])
        .collect()?;
    // rows whose mask is null are dropped
    let frame = table.frame().filter(mask.column(MASK_COLUMN)?.bool()?)?;
    Ok(table.replace_frame(frame))
}

fn map(table: &Table, column: &str, function: &MapFunction, name: &str) -> Result<Table> {
    require_column(table, column)?;
    match function {
        MapFunction::Expression(source) => {
            let parsed = Expression::parse(source)?;
            parsed.check_columns(&table.column_names())?;
            let expr = parsed.to_polars(Some(column))?.alias(name);
            let frame = table.frame().clone().lazy().with_column(expr).collect()?;
            Ok(table.replace_frame(frame))
        }
        MapFunction::Local(f) => {
            let mapped: Vec<Value> = table
                .column_values(column)?
                .iter()
                .map(|v| f.call(v))
                .collect();
            let series = json_values_to_series(name, &mapped)?;
            let mut frame = table.frame().clone();
            frame.with_column(series)?;
            Ok(table.replace_frame(frame))
        }
    }
}

fn sort(table: &Table, column: &str, order: SortOrder) -> Result<Table> {
    require_column(table, column)?;
    let options = SortMultipleOptions {
        descending: vec![order.is_descending()],
        nulls_last: vec![true],
        maintain_order: true,
        ..Default::default()
    };
    let frame = table
        .frame()
        .clone()
        .lazy()
        .sort_by_exprs(vec![col(column)], options)
        .collect()?;
    Ok(table.replace_frame(frame))
}

#[cfg(feature = "sql")]
fn sql(table: &Table, statement: &str) -> Result<Table> {
    use polars_sql::SQLContext;

    let trimmed = statement.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation("SQL statement is empty".to_string()));
    }
    let mut ctx = SQLContext::new();
    ctx.register(SQL_TABLE_NAME, table.frame().clone().lazy());
    let frame = ctx.execute(trimmed)?.collect()?;
    // the statement redefines the columns, so metadata no longer applies
    Ok(Table::new(frame))
}

#[cfg(not(feature = "sql"))]
fn sql(_table: &Table, _statement: &str) -> Result<Table> {
    Err(Error::NotImplemented(
        "SQL support not compiled in (build with --features sql)".to_string(),
    ))
}

/// Scalar reductions available locally and as `compute_*` wire actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    Sum,
    Mean,
    Min,
    Max,
}

impl Reduction {
    pub fn name(&self) -> &'static str {
        match self {
            Reduction::Sum => "sum",
            Reduction::Mean => "mean",
            Reduction::Min => "min",
            Reduction::Max => "max",
        }
    }

    /// Parse the suffix of a `compute_*` action name.
    pub fn from_action(action_type: &str) -> Option<Self> {
        match action_type.strip_prefix("compute_")? {
            "sum" => Some(Reduction::Sum),
            "mean" => Some(Reduction::Mean),
            "min" => Some(Reduction::Min),
            "max" => Some(Reduction::Max),
            _ => None,
        }
    }
}

/// Reduce one column to a scalar. Empty or all-null input yields null
/// (zero for sum).
pub fn reduce(table: &Table, column: &str, reduction: Reduction) -> Result<Value> {
    require_column(table, column)?;
    let dtype = table.frame().column(column)?.dtype().clone();
    if matches!(reduction, Reduction::Sum | Reduction::Mean) && !is_numeric(&dtype) {
        return Err(Error::Validation(format!(
            "{} requires a numeric column, '{}' is {}",
            reduction.name(),
            column,
            dtype
        )));
    }
    let expr = match reduction {
        Reduction::Sum => col(column).sum(),
        Reduction::Mean => col(column).mean(),
        Reduction::Min => col(column).min(),
        Reduction::Max => col(column).max(),
    };
    let out = table.frame().clone().lazy().select([expr]).collect()?;
    if out.height() == 0 {
        return Ok(Value::Null);
    }
    Table::new(out).scalar(0, column)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::LocalFn;
    use crate::table::Metadata;

    fn table() -> Table {
        let frame = df!(
            "a" => [3i64, 1, 2, 1, 5],
            "b" => [Some("x"), Some("y"), None, Some("x"), Some("z")],
            "c" => [10.0f64, 20.0, 30.0, 40.0, 50.0],
            "id" => [0i64, 1, 2, 3, 4]
        )
        .unwrap();
        let mut metadata = Metadata::new();
        metadata.insert("units".into(), "m".into());
        Table::with_metadata(frame, metadata)
    }

    fn ints(t: &Table, name: &str) -> Vec<i64> {
        t.column_values(name)
            .unwrap()
            .into_iter()
            .map(|v| v.as_i64().unwrap())
            .collect()
    }

    #[test]
    fn test_limit() {
        let t = table();
        assert_eq!(apply(&t, &[Action::Limit { count: 2 }]).unwrap().num_rows(), 2);
        assert_eq!(apply(&t, &[Action::Limit { count: 50 }]).unwrap().num_rows(), 5);
        let empty = apply(&t, &[Action::Limit { count: 0 }]).unwrap();
        assert_eq!(empty.num_rows(), 0);
        assert_eq!(empty.column_names(), t.column_names());
        assert_eq!(empty.metadata(), t.metadata());
    }

    #[test]
    fn test_slice_clipped_and_open_ended() {
        let t = table();
        let s = apply(&t, &[Action::Slice { offset: 1, length: Some(2) }]).unwrap();
        assert_eq!(ints(&s, "id"), vec![1, 2]);
        let s = apply(&t, &[Action::Slice { offset: 3, length: None }]).unwrap();
        assert_eq!(ints(&s, "id"), vec![3, 4]);
        let s = apply(&t, &[Action::Slice { offset: 9, length: Some(3) }]).unwrap();
        assert_eq!(s.num_rows(), 0);
    }

    #[test]
    fn test_select_order_and_duplicates() {
        let t = table();
        let s = apply(
            &t,
            &[Action::Select {
                columns: vec!["c".into(), "a".into(), "c".into()],
            }],
        )
        .unwrap();
        assert_eq!(s.column_names(), vec!["c", "a", "c_1"]);
        assert_eq!(s.column_values("c").unwrap(), s.column_values("c_1").unwrap());
        assert_eq!(s.metadata(), t.metadata());
    }

    #[test]
    fn test_select_missing_column_is_not_found() {
        let err = apply(
            &table(),
            &[Action::Limit { count: 1 }, Action::Select { columns: vec!["zz".into()] }],
        )
        .unwrap_err();
        assert!(err.is_not_found());
        assert!(matches!(err, Error::Action { index: 1, .. }));
    }

    #[test]
    fn test_filter_excludes_null_mask() {
        let t = table();
        let f = apply(&t, &[Action::Filter { expression: "b == 'x'".into() }]).unwrap();
        assert_eq!(ints(&f, "id"), vec![0, 3]);
        let f = apply(&t, &[Action::Filter { expression: "b != 'x'".into() }]).unwrap();
        // the null row is neither equal nor unequal
        assert_eq!(ints(&f, "id"), vec![1, 4]);
    }

    #[test]
    fn test_filter_excludes_nan() {
        let t = Table::new(df!("c" => [f64::NAN, 2.0, 0.5], "id" => [0i64, 1, 2]).unwrap());
        let f = apply(&t, &[Action::Filter { expression: "c > 1".into() }]).unwrap();
        assert_eq!(ints(&f, "id"), vec![1]);
        let f = apply(&t, &[Action::Filter { expression: "c <= 1".into() }]).unwrap();
        assert_eq!(ints(&f, "id"), vec![2]);
        // values themselves are untouched
        let f = apply(&t, &[Action::Filter { expression: "id == 0".into() }]).unwrap();
        let kept = f.frame().column("c").unwrap().f64().unwrap().get(0).unwrap();
        assert!(kept.is_nan());
    }

    #[test]
    fn test_filter_zero_matches_keeps_schema() {
        let t = table();
        let f = apply(&t, &[Action::Filter { expression: "a > 100".into() }]).unwrap();
        assert_eq!(f.num_rows(), 0);
        assert_eq!(f.schema_fields(), t.schema_fields());
    }

    #[test]
    fn test_filter_errors() {
        let t = table();
        let err = apply(&t, &[Action::Filter { expression: "a >".into() }]).unwrap_err();
        assert!(matches!(err.root(), Error::Validation(_)));
        let err = apply(&t, &[Action::Filter { expression: "q > 1".into() }]).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_map_expression_default_name() {
        let t = table();
        let m = apply(
            &t,
            &[Action::Map {
                column: "a".into(),
                function: MapFunction::Expression("_ * 2".into()),
                new_column_name: None,
            }],
        )
        .unwrap();
        assert_eq!(m.column_names(), vec!["a", "b", "c", "id", "a_mapped"]);
        assert_eq!(ints(&m, "a_mapped"), vec![6, 2, 4, 2, 10]);
        assert_eq!(ints(&m, "a"), ints(&t, "a"));
    }

    #[test]
    fn test_map_local_closure() {
        let t = table();
        let m = apply(
            &t,
            &[Action::Map {
                column: "a".into(),
                function: MapFunction::Local(LocalFn::new(|v| {
                    Value::from(v.as_i64().unwrap_or_default() + 100)
                })),
                new_column_name: Some("shifted".into()),
            }],
        )
        .unwrap();
        assert_eq!(ints(&m, "shifted"), vec![103, 101, 102, 101, 105]);
    }

    #[test]
    fn test_sort_is_stable() {
        let t = table();
        let s = apply(
            &t,
            &[Action::Sort { column: "a".into(), order: SortOrder::Ascending }],
        )
        .unwrap();
        assert_eq!(ints(&s, "id"), vec![1, 3, 2, 0, 4]);
        let s = apply(
            &t,
            &[Action::Sort { column: "a".into(), order: SortOrder::Descending }],
        )
        .unwrap();
        assert_eq!(ints(&s, "id"), vec![4, 0, 2, 1, 3]);
    }

    #[test]
    fn test_sort_then_reverse_keeps_row_set() {
        let t = table();
        let s = apply(
            &t,
            &[
                Action::Sort { column: "a".into(), order: SortOrder::Ascending },
                Action::Sort { column: "a".into(), order: SortOrder::Descending },
            ],
        )
        .unwrap();
        let mut ids = ints(&s, "id");
        ids.sort();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[cfg(feature = "sql")]
    #[test]
    fn test_sql_replaces_table() {
        let t = table();
        let s = apply(
            &t,
            &[
                Action::Limit { count: 4 },
                Action::Sql {
                    sql_str: "SELECT a, c * 2 AS c2 FROM dataframe WHERE a > 1 ORDER BY a".into(),
                },
                Action::Limit { count: 1 },
            ],
        )
        .unwrap();
        assert_eq!(s.column_names(), vec!["a", "c2"]);
        assert_eq!(ints(&s, "a"), vec![2]);
        assert!(s.metadata().is_empty());
    }

    #[cfg(feature = "sql")]
    #[test]
    fn test_sql_undefined_relation_fails_at_node() {
        let err = apply(&table(), &[Action::Sql { sql_str: "SELECT * FROM nowhere".into() }])
            .unwrap_err();
        assert!(matches!(err, Error::Action { index: 0, .. }));
    }

    #[test]
    fn test_select_commutes_with_slice() {
        let t = table();
        let sel = Action::Select { columns: vec!["a".into(), "c".into()] };
        let sl = Action::Slice { offset: 1, length: Some(3) };
        let x = apply(&t, &[sel.clone(), sl.clone()]).unwrap();
        let y = apply(&t, &[sl, sel]).unwrap();
        assert!(x.same_data(&y));
    }

    #[test]
    fn test_reductions() {
        let t = table();
        assert_eq!(reduce(&t, "a", Reduction::Sum).unwrap(), Value::from(12));
        assert_eq!(reduce(&t, "c", Reduction::Mean).unwrap(), Value::from(30.0));
        assert_eq!(reduce(&t, "a", Reduction::Min).unwrap(), Value::from(1));
        assert_eq!(reduce(&t, "b", Reduction::Max).unwrap(), Value::from("z"));
        assert!(matches!(reduce(&t, "b", Reduction::Sum), Err(Error::Validation(_))));
        assert!(reduce(&t, "nope", Reduction::Min).unwrap_err().is_not_found());
        assert_eq!(Reduction::from_action("compute_mean"), Some(Reduction::Mean));
        assert_eq!(Reduction::from_action("compute_median"), None);
    }
}
