//! Pass/fail results and measurements recorded while driving a device.

use std::{collections::BTreeMap, fmt, time::Duration};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
    Skip,
}
impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::Pass => "pass",
            Outcome::Fail => "fail",
            Outcome::Skip => "skip",
        })
    }
}

/// One named result, optionally carrying a measurement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestResult {
    pub test_case_id: String,
    pub result: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measurement: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Ordered log of results plus free-form metadata for one device run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResultLog {
    results: Vec<TestResult>,
    metadata: BTreeMap<String, String>,
}
impl ResultLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pass(&mut self, id: &str) {
        self.add(id, Outcome::Pass, None);
    }

    pub fn fail(&mut self, id: &str, message: Option<&str>) {
        self.add(id, Outcome::Fail, message);
    }

    /// Record a passing duration in seconds, rounded to hundredths.
    pub fn pass_timed(&mut self, id: &str, elapsed: Duration) {
        let seconds = (elapsed.as_secs_f64() * 100.0).round() / 100.0;
        self.results.push(TestResult {
            test_case_id: id.to_owned(),
            result: Outcome::Pass,
            measurement: Some(seconds),
            units: Some("seconds".into()),
            message: None,
        });
    }

    pub fn add_metadata(&mut self, key: &str, value: &str) {
        self.metadata.insert(key.to_owned(), value.to_owned());
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Latest result recorded under `id`.
    pub fn find(&self, id: &str) -> Option<&TestResult> {
        self.results.iter().rev().find(|r| r.test_case_id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TestResult> {
        self.results.iter()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn failures(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.result == Outcome::Fail)
            .count()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    fn add(&mut self, id: &str, result: Outcome, message: Option<&str>) {
        self.results.push(TestResult {
            test_case_id: id.to_owned(),
            result,
            measurement: None,
            units: None,
            message: message.map(str::to_owned),
        });
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
