//! JSON histogram files.
//!
//! A file is one JSON object mapping object names to histograms:
//!
//! ```json
//! { "histograms": { "bkg": { "axes": [{ "bins": 10, "min": 0, "max": 100 }], "contents": [...] } } }
//! ```

use crate::histogram::Histogram;
use ms_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Named collection of histograms persisted as JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramFile {
    histograms: BTreeMap<String, Histogram>,
}

impl HistogramFile {
    /// Empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a collection from `path`.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Io(std::io::Error::new(e.kind(), format!("{}: {}", path.display(), e)))
        })?;
        let mut file: HistogramFile = serde_json::from_str(&text)?;
        for (key, h) in file.histograms.iter_mut() {
            if h.name().is_empty() {
                h.set_name(key.clone());
            }
        }
        log::debug!("read {} histograms from {}", file.histograms.len(), path.display());
        Ok(file)
    }

    /// Write the collection to `path` as pretty JSON.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Histogram stored under `name`.
    pub fn get(&self, name: &str) -> Result<&Histogram> {
        self.histograms.get(name).ok_or_else(|| Error::UnknownTemplate(name.to_string()))
    }

    /// Store `hist` under its own name, returning any histogram it replaced.
    pub fn insert(&mut self, hist: Histogram) -> Option<Histogram> {
        self.histograms.insert(hist.name().to_string(), hist)
    }

    /// Stored names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.histograms.keys().map(String::as_str)
    }

    /// Number of stored histograms.
    pub fn len(&self) -> usize {
        self.histograms.len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.histograms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Axis;

    #[test]
    fn test_write_read() {
        let mut h = Histogram::new("bkg", vec![Axis::uniform(3, 0.0, 3.0).unwrap()]).unwrap();
        h.fill(&[1.5], 2.0).unwrap();
        let mut file = HistogramFile::new();
        assert!(file.insert(h.clone()).is_none());

        let path = std::env::temp_dir().join(format!("ms_hist_io_{}.json", std::process::id()));
        file.write(&path).unwrap();
        let back = HistogramFile::read(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(back.get("bkg").unwrap(), &h);
        assert!(matches!(back.get("sig"), Err(Error::UnknownTemplate(_))));
        assert_eq!(back.names().collect::<Vec<_>>(), vec!["bkg"]);
    }

    #[test]
    fn test_missing_name_taken_from_key() {
        let json = r#"{"histograms": {"data": {"axes": [{"bins": 1, "min": 0, "max": 1}]}}}"#;
        let path = std::env::temp_dir().join(format!("ms_hist_key_{}.json", std::process::id()));
        std::fs::write(&path, json).unwrap();
        let file = HistogramFile::read(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(file.get("data").unwrap().name(), "data");
        assert!(HistogramFile::read("/nonexistent/ms_hist.json").is_err());
    }
}
