use fail::FailScenario;

/// Configures failpoints for the lifetime of the value and turns them off on drop.
///
/// Holds the global failpoint lock, so tests using it run one at a time.
pub struct FailpointScenario<'a> {
    _scenario: FailScenario<'a>,
    failpoints: Vec<String>,
}

impl<'a> FailpointScenario<'a> {
    /// Applies every `(failpoint, action)` pair, e.g. `("load_table.before_dedup", "return")`.
    pub fn setup(failpoints: &[(&str, &str)]) -> FailpointScenario<'a> {
        let scenario = FailScenario::setup();
        for (failpoint, action) in failpoints {
            fail::cfg(*failpoint, action).expect("Failed to configure failpoint");
        }

        Self {
            _scenario: scenario,
            failpoints: failpoints
                .iter()
                .map(|(failpoint, _)| failpoint.to_string())
                .collect(),
        }
    }
}

impl Drop for FailpointScenario<'_> {
    fn drop(&mut self) {
        for failpoint in &self.failpoints {
            let _ = fail::cfg(failpoint.as_str(), "off");
        }
    }
}
