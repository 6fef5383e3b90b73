//! The load plan: how many iterations, over how long, in what shape.

use url::Url;

use crate::error::EngineError;
use crate::scenario::Scenario;

/// Default iteration count when the plan specifies none.
pub const DEFAULT_ITERATIONS: u64 = 100;
/// Default test duration, seconds.
pub const DEFAULT_DURATION_SECS: u64 = 10;
/// Default per-step timeout, seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;
/// Default report surface tag.
pub const DEFAULT_OUTPUT: &str = "stdout";

/// How the total request volume is distributed over the test window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadShape {
    #[default]
    Linear,
    Incremental,
    Waved,
}

impl LoadShape {
    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        match raw.to_ascii_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "incremental" => Ok(Self::Incremental),
            "waved" => Ok(Self::Waved),
            other => Err(EngineError::validation(format!(
                "unsupported load_type: {other}"
            ))),
        }
    }
}

/// One entry of an explicit time/count program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramEntry {
    pub duration_secs: u64,
    pub count: u64,
}

/// A validated, immutable test plan.
///
/// Either `program` is non-empty (and the effective iteration count and
/// duration are its sums), or the `iteration_count`/`duration_secs`/`shape`
/// triple applies.
#[derive(Debug, Clone)]
pub struct LoadPlan {
    pub iteration_count: u64,
    pub duration_secs: u64,
    pub shape: LoadShape,
    pub program: Vec<ProgramEntry>,
    pub scenario: Scenario,
    pub proxy: Option<Url>,
    /// Tag handed to the report surface.
    pub output: String,
    pub debug: bool,
}

impl LoadPlan {
    /// Effective iteration count: the program's sum when present.
    pub fn effective_iterations(&self) -> u64 {
        if self.program.is_empty() {
            self.iteration_count
        } else {
            self.program.iter().map(|e| e.count).sum()
        }
    }

    /// Effective wall-clock duration: the program's sum when present.
    pub fn effective_duration_secs(&self) -> u64 {
        if self.program.is_empty() {
            self.duration_secs
        } else {
            self.program.iter().map(|e| e.duration_secs).sum()
        }
    }

    /// Preflight validation. Any failure aborts the test before the first
    /// worker launches.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.scenario.steps.is_empty() {
            return Err(EngineError::validation("scenario or target is empty"));
        }
        self.scenario.validate()?;

        for entry in &self.program {
            if entry.duration_secs < 1 {
                return Err(EngineError::validation(
                    "duration in manual_load should be greater than 0",
                ));
            }
        }
        if self.program.is_empty() && self.duration_secs < 1 {
            return Err(EngineError::validation(
                "duration should be greater than 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::Scenario;
    use http::Method;

    fn scenario() -> Scenario {
        let mut s = Scenario::default();
        s.steps.push(crate::scenario::ScenarioStep {
            id: 1,
            name: "hit".to_string(),
            method: Method::GET,
            url: "https://example.com".to_string(),
            headers: Vec::new(),
            payload: Vec::new(),
            timeout_secs: 5,
            sleep: crate::scenario::Sleep::None,
            auth: None,
            tls_identity: None,
            options: crate::scenario::StepOptions::default(),
            captures: Vec::new(),
        });
        s
    }

    fn plan() -> LoadPlan {
        LoadPlan {
            iteration_count: 100,
            duration_secs: 10,
            shape: LoadShape::Linear,
            program: Vec::new(),
            scenario: scenario(),
            proxy: None,
            output: DEFAULT_OUTPUT.to_string(),
            debug: false,
        }
    }

    #[test]
    fn test_shape_parse() {
        assert_eq!(LoadShape::parse("linear").unwrap(), LoadShape::Linear);
        assert_eq!(LoadShape::parse("Incremental").unwrap(), LoadShape::Incremental);
        assert_eq!(LoadShape::parse("WAVED").unwrap(), LoadShape::Waved);
        assert!(LoadShape::parse("spiky").is_err());
    }

    #[test]
    fn test_effective_counts_without_program() {
        let p = plan();
        assert_eq!(p.effective_iterations(), 100);
        assert_eq!(p.effective_duration_secs(), 10);
    }

    #[test]
    fn test_effective_counts_with_program() {
        let mut p = plan();
        p.program = vec![
            ProgramEntry {
                duration_secs: 2,
                count: 4,
            },
            ProgramEntry {
                duration_secs: 3,
                count: 9,
            },
        ];
        assert_eq!(p.effective_iterations(), 13);
        assert_eq!(p.effective_duration_secs(), 5);
    }

    #[test]
    fn test_validate_rejects_empty_scenario() {
        let mut p = plan();
        p.scenario.steps.clear();
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_program_duration() {
        let mut p = plan();
        p.program = vec![ProgramEntry {
            duration_secs: 0,
            count: 5,
        }];
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(plan().validate().is_ok());
    }
}
