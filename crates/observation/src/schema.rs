use serde::{Deserialize, Serialize};

/// Severity of a reported finding. Ordering is most-severe-first so sorting a
/// findings list by severity needs no custom comparator.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Medium
    }
}

/// Which task the agent was given for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskVariant {
    Explore,
    Guided,
    Construction,
}

impl TaskVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskVariant::Explore => "explore",
            TaskVariant::Guided => "guided",
            TaskVariant::Construction => "construction",
        }
    }
}

/// A structured record of one agent session, emitted terminally as a
/// sentinel-bracketed JSON block and/or incrementally as marker lines.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Observation {
    pub session_summary: String,
    pub bootstrap: BootstrapExperience,
    pub features_used: Vec<FeatureUse>,
    pub constructions_used: Vec<ConstructionUse>,
    pub compositions_attempted: Vec<CompositionAttempt>,
    pub registry: RegistryExperience,
    pub negative_findings: Vec<ReportedFinding>,
    pub positive_findings: Vec<ReportedFinding>,
    pub implicit_flags: Vec<String>,
    pub verdict: Verdict,
    pub nps_roadmap: Vec<String>,
    #[serde(rename = "pathTo10")]
    pub path_to_ten: String,
    pub fix_recommendations: Vec<FixRecommendation>,
}

impl Observation {
    /// Clamps fields whose wire form allows out-of-range values.
    pub fn normalize(&mut self) {
        if self.verdict.nps > 10 {
            self.verdict.nps = 10;
        }
    }

    /// True when any section carries content; used to distinguish an
    /// assembled observation from the default shape.
    pub fn has_content(&self) -> bool {
        *self != Observation::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BootstrapExperience {
    pub succeeded: bool,
    pub duration_ms: Option<u64>,
    pub notes: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeatureUse {
    pub feature: String,
    pub outcome: String,
    pub notes: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConstructionUse {
    pub construction_id: String,
    pub outcome: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompositionAttempt {
    pub description: String,
    pub succeeded: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryExperience {
    pub discoverable: bool,
    pub notes: String,
}

/// A single negative or positive finding as the agent reported it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReportedFinding {
    pub category: String,
    pub severity: Severity,
    pub title: String,
    pub detail: String,
    pub suggested_fix: Option<String>,
    pub effort_estimate: Option<String>,
    pub nps_impact: Option<f64>,
}

/// The agent's overall verdict; `nps` is an integer in `[0, 10]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Verdict {
    pub nps: u8,
    pub would_recommend: bool,
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FixRecommendation {
    pub title: String,
    pub detail: String,
    pub priority: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_sorts_most_severe_first() {
        let mut severities = vec![Severity::Low, Severity::Critical, Severity::Medium];
        severities.sort();
        assert_eq!(
            severities,
            vec![Severity::Critical, Severity::Medium, Severity::Low]
        );
    }

    #[test]
    fn observation_round_trips_through_json() {
        let mut observation = Observation::default();
        observation.session_summary = "short session".to_string();
        observation.verdict = Verdict {
            nps: 8,
            would_recommend: true,
            summary: "solid".to_string(),
        };
        observation.negative_findings.push(ReportedFinding {
            category: "bootstrap".to_string(),
            severity: Severity::High,
            title: "slow cold start".to_string(),
            detail: "first index took minutes".to_string(),
            suggested_fix: Some("cache embeddings".to_string()),
            effort_estimate: None,
            nps_impact: Some(-1.0),
        });

        let json = serde_json::to_string(&observation).unwrap();
        assert!(json.contains("\"pathTo10\""));
        assert!(json.contains("\"sessionSummary\""));
        let back: Observation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, observation);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let observation: Observation = serde_json::from_str("{}").unwrap();
        assert!(!observation.has_content());
        let finding: ReportedFinding =
            serde_json::from_str("{\"title\":\"x\"}").unwrap();
        assert_eq!(finding.severity, Severity::Medium);
    }

    #[test]
    fn normalize_clamps_nps() {
        let mut observation = Observation::default();
        observation.verdict.nps = 42;
        observation.normalize();
        assert_eq!(observation.verdict.nps, 10);
    }
}
