//! Persisted run log record.

use super::order::{Operator, ProductionOrder};
use super::state::{ProductionRun, StopReason};
use chrono::{DateTime, Local, NaiveDate};
use serde::{Deserialize, Serialize};

/// What the run store keeps for one finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Operator id
    pub operator_id: String,
    /// Operator login name
    pub operator_name: String,
    /// Production date (local)
    pub date: NaiveDate,
    /// Run start
    pub start_time: DateTime<Local>,
    /// Run end
    pub end_time: DateTime<Local>,
    /// Counter at start
    pub start_count: u32,
    /// Counter at end (labels printed)
    pub end_count: u32,
    /// Units produced in this run
    pub total_produced: u32,
    /// Requested target
    pub target_count: u32,
    /// Order reference
    pub order_number: String,
    /// Material code
    pub material: String,
    /// Batch identifier
    pub batch: String,
    /// Supplier batch identifier
    pub vendor_batch: String,
    /// Material description
    pub description: String,
    /// Why the run ended
    pub stop_reason: StopReason,
    /// Serial numbers printed, in order
    pub serial_numbers: Vec<String>,
}

impl RunRecord {
    /// Build the record for `run` ending at `ended_at`.
    pub fn from_run(
        run: &ProductionRun,
        order: &ProductionOrder,
        operator: &Operator,
        stop_reason: StopReason,
        ended_at: DateTime<Local>,
    ) -> Self {
        let start_time = run.started_at();
        Self {
            operator_id: operator.id.clone(),
            operator_name: operator.username.clone(),
            date: start_time.date_naive(),
            start_time,
            end_time: ended_at,
            start_count: run.start_count(),
            end_count: run.printed(),
            total_produced: run.printed() - run.start_count(),
            target_count: run.target(),
            order_number: order.order_number.clone(),
            material: order.material.clone(),
            batch: order.batch.clone(),
            vendor_batch: order.vendor_batch.clone(),
            description: order.description.clone(),
            stop_reason,
            serial_numbers: run.serials().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_from_partial_run() {
        let order = ProductionOrder {
            material: "MAT-7".into(),
            batch: "B9".into(),
            description: "Gauze".into(),
            ..Default::default()
        };
        let operator = Operator::new("42", "nurse.kim");
        let mut run = ProductionRun::new(10, "B9", Local::now());
        for i in 1..=3 {
            run.record_print(format!("B9-{i}"));
        }

        let record = RunRecord::from_run(&run, &order, &operator, StopReason::Operator, Local::now());
        assert_eq!(record.end_count, 3);
        assert_eq!(record.total_produced, 3);
        assert_eq!(record.target_count, 10);
        assert_eq!(record.serial_numbers, vec!["B9-1", "B9-2", "B9-3"]);
        assert_eq!(record.operator_name, "nurse.kim");
        assert_eq!(record.date, run.started_at().date_naive());
    }
}
