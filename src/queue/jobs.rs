// Background job definitions

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizeTarget {
    Gallery,
    Final,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "target", rename_all = "snake_case")]
pub enum Job {
    /// Ensure every managed folder exists, then optimize both pairs
    Startup,
    Optimize(OptimizeTarget),
    Sweep,
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::Startup => "startup",
            Job::Optimize(OptimizeTarget::Gallery) => "optimize_gallery",
            Job::Optimize(OptimizeTarget::Final) => "optimize_final",
            Job::Sweep => "sweep",
        }
    }
}
