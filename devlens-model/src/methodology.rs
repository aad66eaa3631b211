use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The four methodologies devlens scores adherence against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Methodology {
    Ddd,
    Tdd,
    Bdd,
    Eda,
}

impl Methodology {
    pub const ALL: [Methodology; 4] = [
        Methodology::Ddd,
        Methodology::Tdd,
        Methodology::Bdd,
        Methodology::Eda,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Methodology::Ddd => "ddd",
            Methodology::Tdd => "tdd",
            Methodology::Bdd => "bdd",
            Methodology::Eda => "eda",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.as_str() == s)
    }
}

impl std::fmt::Display for Methodology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A 0..=100 adherence measure with its supporting evidence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodologyScore {
    pub score: f64,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub recommendations: Vec<String>,
    /// Counter-level detail, e.g. `entity_markers -> 12`.
    pub details: HashMap<String, u64>,
}

impl MethodologyScore {
    pub fn clamped(mut self) -> Self {
        self.score = self.score.clamp(0.0, 100.0);
        self
    }
}
