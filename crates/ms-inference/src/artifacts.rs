//! Persisted fit-result table.
//!
//! One row per fit: the minimizer status, the minimum NLL and, for every
//! registry parameter, its value and error. The column schema is fixed when
//! the table is created and every appended row must match it.
//!
//! JSON has no encoding for non-finite numbers, so cells holding NaN or an
//! infinity are written as the strings `"NaN"`, `"inf"` and `"-inf"`.

use ms_core::{Error, FitResult, ParameterRegistry, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Column holding the minimizer status.
pub const STATUS_COLUMN: &str = "minuitStatus";
/// Column holding the minimum NLL.
pub const NLL_COLUMN: &str = "absNLLMin";
/// Suffix of the error column of each parameter.
pub const ERROR_SUFFIX: &str = "Err";

/// Growable table of fit results with a fixed schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitTable {
    columns: Vec<String>,
    #[serde(with = "cells")]
    rows: Vec<Vec<f64>>,
}

mod cells {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Cell {
        Number(f64),
        Text(String),
    }

    fn encode(v: f64) -> Cell {
        if v.is_nan() {
            Cell::Text("NaN".into())
        } else if v.is_infinite() {
            Cell::Text(if v > 0.0 { "inf" } else { "-inf" }.into())
        } else {
            Cell::Number(v)
        }
    }

    pub fn serialize<S: Serializer>(rows: &[Vec<f64>], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(rows.iter().map(|r| r.iter().copied().map(encode).collect::<Vec<_>>()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Vec<f64>>, D::Error> {
        let raw: Vec<Vec<Option<Cell>>> = Vec::deserialize(deserializer)?;
        raw.into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|cell| match cell {
                        Some(Cell::Number(v)) => Ok(v),
                        // Older tables wrote non-finite cells as null.
                        None => Ok(f64::NAN),
                        Some(Cell::Text(t)) => match t.as_str() {
                            "NaN" => Ok(f64::NAN),
                            "inf" => Ok(f64::INFINITY),
                            "-inf" => Ok(f64::NEG_INFINITY),
                            other => Err(D::Error::custom(format!("invalid fit table cell '{other}'"))),
                        },
                    })
                    .collect()
            })
            .collect()
    }
}

impl FitTable {
    /// Empty table for the given parameter names, in column order.
    pub fn new<S: AsRef<str>>(parameters: &[S]) -> Self {
        let mut columns = vec![STATUS_COLUMN.to_string(), NLL_COLUMN.to_string()];
        for p in parameters {
            columns.push(p.as_ref().to_string());
            columns.push(format!("{}{}", p.as_ref(), ERROR_SUFFIX));
        }
        Self { columns, rows: Vec::new() }
    }

    /// Empty table with one value/error pair per registry parameter.
    pub fn from_registry(registry: &ParameterRegistry) -> Self {
        Self::new(&registry.names())
    }

    /// Column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows, each parallel to [`FitTable::columns`].
    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Parameter names of the schema.
    pub fn parameter_names(&self) -> Vec<&str> {
        self.columns.iter().skip(2).step_by(2).map(String::as_str).collect()
    }

    /// Values of column `name`.
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().map(|r| r[idx]).collect())
    }

    /// Append one row; the parameters of `result` must match the schema.
    pub fn append(&mut self, result: &FitResult) -> Result<()> {
        let names = self.parameter_names();
        if names != result.parameter_names() {
            return Err(Error::Validation(format!(
                "fit result parameters {:?} do not match table schema {:?}",
                result.parameter_names(),
                names
            )));
        }
        let mut row = Vec::with_capacity(self.columns.len());
        row.push(result.status as f64);
        row.push(result.min_nll);
        for p in &result.parameters {
            row.push(p.value);
            row.push(p.error);
        }
        self.rows.push(row);
        Ok(())
    }

    /// Write the table as JSON.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path.as_ref(), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Read a table written by [`FitTable::write`].
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let table: FitTable = serde_json::from_str(&text)?;
        if table.columns.len() < 2 || table.columns.len() % 2 != 0 {
            return Err(Error::Validation(format!("malformed fit table with {} columns", table.columns.len())));
        }
        if let Some(bad) = table.rows.iter().position(|r| r.len() != table.columns.len()) {
            return Err(Error::Validation(format!("row {bad} does not match the table columns")));
        }
        Ok(table)
    }

    /// With `append` and an existing file, load it and check that its schema
    /// matches `parameters`; otherwise start an empty table.
    pub fn open_or_create<S: AsRef<str>>(path: impl AsRef<Path>, parameters: &[S], append: bool) -> Result<Self> {
        let fresh = Self::new(parameters);
        let path = path.as_ref();
        if !(append && path.exists()) {
            return Ok(fresh);
        }
        let existing = Self::read(path)?;
        if existing.columns != fresh.columns {
            return Err(Error::Validation(format!(
                "cannot append to {}: its columns differ from the current parameters",
                path.display()
            )));
        }
        log::debug!("appending to {} ({} rows)", path.display(), existing.len());
        Ok(existing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ms_core::{Parameter, ParameterEstimate};

    fn result(status: i32, a: f64) -> FitResult {
        FitResult {
            status,
            min_nll: 1.5,
            edm: 0.0,
            cov_quality: 3,
            n_fails: 0,
            parameters: vec![
                ParameterEstimate { name: "ds.A".into(), value: a, error: 0.5, fixed: false },
                ParameterEstimate { name: "global.s".into(), value: 2.0, error: 0.1, fixed: false },
            ],
        }
    }

    #[test]
    fn test_schema_from_registry() {
        let mut reg = ParameterRegistry::new();
        reg.insert_if_absent(Parameter::new("ds.A"));
        reg.insert_if_absent(Parameter::new("global.s").global(true));
        let table = FitTable::from_registry(&reg);
        assert_eq!(table.columns(), &["minuitStatus", "absNLLMin", "ds.A", "ds.AErr", "global.s", "global.sErr"]);
        assert_eq!(table.parameter_names(), vec!["ds.A", "global.s"]);
    }

    #[test]
    fn test_append_checks_schema() {
        let mut table = FitTable::new(&["ds.A", "global.s"]);
        table.append(&result(0, 3.0)).unwrap();
        table.append(&result(4, 4.0)).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.column("ds.A"), Some(vec![3.0, 4.0]));
        assert_eq!(table.column("minuitStatus"), Some(vec![0.0, 4.0]));

        let mut other = FitTable::new(&["ds.B"]);
        assert!(other.append(&result(0, 1.0)).is_err());
        assert!(other.is_empty());
    }

    #[test]
    fn test_append_mode_on_disk() {
        let dir = std::env::temp_dir().join(format!("mstats-fittable-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("table.json");

        let mut table = FitTable::open_or_create(&path, &["ds.A", "global.s"], true).unwrap();
        table.append(&result(0, 3.0)).unwrap();
        table.write(&path).unwrap();

        let mut again = FitTable::open_or_create(&path, &["ds.A", "global.s"], true).unwrap();
        assert_eq!(again.len(), 1);
        again.append(&result(0, 5.0)).unwrap();
        again.write(&path).unwrap();
        assert_eq!(FitTable::read(&path).unwrap().len(), 2);

        assert!(FitTable::open_or_create(&path, &["ds.A"], true).is_err());
        assert!(FitTable::open_or_create(&path, &["ds.A"], false).unwrap().is_empty());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_failed_fit_rows_survive_append() {
        let dir = std::env::temp_dir().join(format!("mstats-fittable-failed-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("table.json");

        let mut failed = result(4, f64::NAN);
        failed.min_nll = f64::INFINITY;
        failed.parameters[1].error = f64::NEG_INFINITY;
        let mut table = FitTable::new(&["ds.A", "global.s"]);
        table.append(&failed).unwrap();
        table.append(&result(0, 3.0)).unwrap();
        table.write(&path).unwrap();

        let mut again = FitTable::open_or_create(&path, &["ds.A", "global.s"], true).unwrap();
        assert_eq!(again.len(), 2);
        let row = &again.rows()[0];
        assert_eq!(row[0], 4.0);
        assert_eq!(row[1], f64::INFINITY);
        assert!(row[2].is_nan());
        assert_eq!(row[5], f64::NEG_INFINITY);
        assert_eq!(again.rows()[1], table.rows()[1]);

        again.append(&result(0, 5.0)).unwrap();
        again.write(&path).unwrap();
        assert_eq!(FitTable::read(&path).unwrap().len(), 3);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_null_cells_read_as_nan() {
        let text = r#"{"columns":["minuitStatus","absNLLMin"],"rows":[[4.0,null]]}"#;
        let table: FitTable = serde_json::from_str(text).unwrap();
        assert!(table.rows()[0][1].is_nan());

        let bad = r#"{"columns":["minuitStatus","absNLLMin"],"rows":[[4.0,"big"]]}"#;
        assert!(serde_json::from_str::<FitTable>(bad).is_err());
    }
}
