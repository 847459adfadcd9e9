//! Label printing.
//!
//! A [`Label`] carries the QR payload and the text fields printed next to it.
//! Rendering the physical label is the printer's business; the run controller
//! only needs [`LabelPrinter::print`] to resolve once the print is confirmed.

use crate::config::PrinterConfig;
use crate::production::order::ProductionOrder;
use crate::storage::file_stem;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// One unit label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    /// Serial number of the labelled unit
    pub serial: String,
    /// Data encoded in the QR code
    pub qr_payload: String,
    /// Human-readable fields, in print order
    pub fields: Vec<(String, String)>,
}

impl Label {
    /// Build the label for unit `serial` of `order`.
    pub fn for_unit(order: &ProductionOrder, serial: &str, printed_at: DateTime<Local>) -> Self {
        let qr_payload = serde_json::json!({
            "serial": serial,
            "material": order.material,
            "batch": order.batch,
            "vendor_batch": order.vendor_batch,
        })
        .to_string();

        let fields = vec![
            ("Material".to_string(), order.material.clone()),
            ("Description".to_string(), order.description.clone()),
            ("Batch".to_string(), order.batch.clone()),
            ("Serial".to_string(), serial.to_string()),
            (
                "Date".to_string(),
                printed_at.format("%Y-%m-%d %H:%M").to_string(),
            ),
        ];

        Self {
            serial: serial.to_string(),
            qr_payload,
            fields,
        }
    }
}

/// Host print service.
#[async_trait]
pub trait LabelPrinter: Send + Sync {
    /// Print `label`, resolving once printing is confirmed.
    async fn print(&self, label: &Label) -> Result<()>;
}

/// Writes each label as JSON into a spool directory picked up by the print host.
///
/// A spool write that has not completed within the fallback timeout is treated
/// as printed.
pub struct SpoolPrinter {
    spool_dir: PathBuf,
    fallback_timeout: Duration,
}

impl SpoolPrinter {
    /// Create a printer spooling into `spool_dir`.
    pub fn new(spool_dir: impl Into<PathBuf>, fallback_timeout: Duration) -> Self {
        Self {
            spool_dir: spool_dir.into(),
            fallback_timeout,
        }
    }

    /// Create a printer from configuration.
    pub fn from_config(config: &PrinterConfig) -> Self {
        Self::new(config.spool_dir.clone(), config.fallback_timeout)
    }

    async fn spool(&self, label: &Label) -> Result<()> {
        tokio::fs::create_dir_all(&self.spool_dir)
            .await
            .with_context(|| format!("Failed to create spool directory {:?}", self.spool_dir))?;

        let path = self
            .spool_dir
            .join(format!("{}.json", file_stem(&label.serial)));
        let json = serde_json::to_vec_pretty(label).context("Failed to serialize label")?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write label to {:?}", path))?;

        debug!(serial = %label.serial, path = ?path, "Label spooled");
        Ok(())
    }
}

#[async_trait]
impl LabelPrinter for SpoolPrinter {
    async fn print(&self, label: &Label) -> Result<()> {
        match tokio::time::timeout(self.fallback_timeout, self.spool(label)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    serial = %label.serial,
                    "No print confirmation within {:?}, assuming printed",
                    self.fallback_timeout
                );
                Ok(())
            }
        }
    }
}

/// In-memory printer for tests and simulation.
#[derive(Default)]
pub struct MemoryPrinter {
    labels: Mutex<Vec<Label>>,
    delay: Duration,
    fail_at: Option<usize>,
    attempts: AtomicUsize,
}

impl MemoryPrinter {
    /// Printer that confirms immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Printer that takes `delay` per label.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Printer whose `n`-th print attempt (1-based) fails.
    pub fn failing_at(n: usize) -> Self {
        Self {
            fail_at: Some(n),
            ..Self::default()
        }
    }

    /// Labels printed so far.
    pub fn labels(&self) -> Vec<Label> {
        self.labels.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of labels printed.
    pub fn printed(&self) -> usize {
        self.labels.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl LabelPrinter for MemoryPrinter {
    async fn print(&self, label: &Label) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_at == Some(attempt) {
            return Err(anyhow!("printer jammed on attempt {attempt}"));
        }
        self.labels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(label.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> ProductionOrder {
        ProductionOrder {
            order_number: "PO-1".into(),
            material: "MAT-7".into(),
            batch: "B1".into(),
            vendor_batch: "V1".into(),
            description: "Gauze".into(),
        }
    }

    #[test]
    fn test_label_payload() {
        let label = Label::for_unit(&order(), "B1-4", Local::now());
        let payload: serde_json::Value = serde_json::from_str(&label.qr_payload).unwrap();
        assert_eq!(payload["serial"], "B1-4");
        assert_eq!(payload["vendor_batch"], "V1");
        assert!(label
            .fields
            .iter()
            .any(|(k, v)| k == "Description" && v == "Gauze"));
    }

    #[tokio::test]
    async fn test_spool_printer_writes_label() {
        let dir = tempfile::tempdir().unwrap();
        let printer = SpoolPrinter::new(dir.path().join("spool"), Duration::from_secs(1));
        let label = Label::for_unit(&order(), "B1-1", Local::now());

        printer.print(&label).await.unwrap();

        let written = std::fs::read_to_string(dir.path().join("spool").join("B1-1.json")).unwrap();
        let parsed: Label = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed, label);
    }

    #[tokio::test]
    async fn test_spool_file_stays_in_spool_dir() {
        let dir = tempfile::tempdir().unwrap();
        let spool = dir.path().join("spool");
        let printer = SpoolPrinter::new(&spool, Duration::from_secs(1));
        let label = Label::for_unit(&order(), "../../B/1-3", Local::now());

        printer.print(&label).await.unwrap();

        let written: Vec<_> = std::fs::read_dir(&spool)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(written, vec!["______B_1-3.json"]);
        assert!(!dir.path().join("B").exists());
    }

    #[tokio::test]
    async fn test_memory_printer_failure() {
        let printer = MemoryPrinter::failing_at(2);
        let label = Label::for_unit(&order(), "B1-1", Local::now());

        assert!(printer.print(&label).await.is_ok());
        assert!(printer.print(&label).await.is_err());
        assert!(printer.print(&label).await.is_ok());
        assert_eq!(printer.printed(), 2);
    }
}
