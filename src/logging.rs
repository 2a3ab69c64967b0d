// Per-run logging context: console through `tracing`, plus a text log file and
// a metrics sink on the primary rank only.

use anyhow::{Context, Result};
use serde_json::json;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

pub trait MetricsSink {
    fn log_scalars(&mut self, step: usize, scalars: &[(&str, f64)]) -> Result<()>;
    fn log_row(&mut self, table: &str, step: usize, cells: &[String]) -> Result<()>;
}

/// Drops everything.
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn log_scalars(&mut self, _step: usize, _scalars: &[(&str, f64)]) -> Result<()> {
        Ok(())
    }

    fn log_row(&mut self, _table: &str, _step: usize, _cells: &[String]) -> Result<()> {
        Ok(())
    }
}

/// One JSON object per line.
pub struct JsonlMetrics {
    out: BufWriter<File>,
}

impl JsonlMetrics {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        Ok(Self { out: BufWriter::new(file) })
    }

    fn write(&mut self, value: serde_json::Value) -> Result<()> {
        serde_json::to_writer(&mut self.out, &value)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }
}

impl MetricsSink for JsonlMetrics {
    fn log_scalars(&mut self, step: usize, scalars: &[(&str, f64)]) -> Result<()> {
        let mut obj = serde_json::Map::new();
        obj.insert("step".into(), json!(step));
        for (name, value) in scalars {
            obj.insert((*name).to_string(), json!(value));
        }
        self.write(serde_json::Value::Object(obj))
    }

    fn log_row(&mut self, table: &str, step: usize, cells: &[String]) -> Result<()> {
        self.write(json!({ "table": table, "step": step, "cells": cells }))
    }
}

pub struct RunLog {
    primary: bool,
    file: Option<BufWriter<File>>,
    metrics: Box<dyn MetricsSink>,
}

impl RunLog {
    /// Console only.
    pub fn console() -> Self {
        Self { primary: false, file: None, metrics: Box::new(NullMetrics) }
    }

    /// On the primary rank, appends to `log_path` and writes metrics; other
    /// ranks get a console-only log.
    pub fn open(primary: bool, log_path: &Path, metrics: Box<dyn MetricsSink>) -> Result<Self> {
        if !primary {
            return Ok(Self::console());
        }
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .with_context(|| format!("opening {}", log_path.display()))?;
        Ok(Self { primary, file: Some(BufWriter::new(file)), metrics })
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn line(&mut self, msg: &str) -> Result<()> {
        tracing::info!("{msg}");
        if let Some(f) = self.file.as_mut() {
            writeln!(f, "{msg}")?;
            f.flush()?;
        }
        Ok(())
    }

    pub fn separator(&mut self) -> Result<()> {
        self.line(&"_".repeat(40))
    }

    pub fn scalars(&mut self, step: usize, scalars: &[(&str, f64)]) -> Result<()> {
        if self.primary {
            self.metrics.log_scalars(step, scalars)?;
        }
        Ok(())
    }

    pub fn row(&mut self, table: &str, step: usize, cells: &[String]) -> Result<()> {
        if self.primary {
            self.metrics.log_row(table, step, cells)?;
        }
        Ok(())
    }
}
