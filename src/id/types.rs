use serde::{Deserialize, Serialize};

/// Encoding used for generated file identifiers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum IdStrategy {
    /// Random 128-bit UUID, no embedded ordering.
    Uuid,
    /// `<13-hex ms timestamp>-<8-hex node id>-<6-hex counter>`, monotonic
    /// per generator instance.
    TimestampCounter,
    /// `<13-hex ms timestamp>-<8-hex random>-<4-hex node id>-<4-hex counter>`,
    /// collision-safe across independent instances, approximately sortable.
    #[default]
    Hybrid,
    /// Caller-supplied generator function.
    Custom,
}

/// Fields recovered from a generated identifier.
///
/// For `Uuid` ids only the strategy tag is populated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdInfo {
    pub strategy: IdStrategy,
    pub timestamp_ms: Option<i64>,
    pub node_id: Option<u32>,
    pub counter: Option<u32>,
}

impl IdInfo {
    pub fn strategy_only(strategy: IdStrategy) -> Self {
        Self {
            strategy,
            timestamp_ms: None,
            node_id: None,
            counter: None,
        }
    }
}
