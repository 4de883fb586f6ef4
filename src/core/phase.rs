//! Pipeline phases and transition legality.

use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::Error;

/// One of the four pipeline stages a step runs under.
///
/// Ordinals are frozen and never change across refactorings; `0` is the
/// reserved invalid sentinel and no `Phase` value ever carries it. On disk a
/// phase is always the string form; the numeric form is accepted on read
/// only as a backwards-compat escape for old logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    DataIngestion = 1,
    SignalGeneration = 2,
    RiskValidation = 3,
    OrderExecution = 4,
}

impl Phase {
    /// All phases in pipeline order.
    pub const ALL: [Phase; 4] = [
        Phase::DataIngestion,
        Phase::SignalGeneration,
        Phase::RiskValidation,
        Phase::OrderExecution,
    ];

    const NAMES: [&'static str; 4] = [
        "data_ingestion",
        "signal_generation",
        "risk_validation",
        "order_execution",
    ];

    /// Frozen numeric ordinal (1-based).
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// The canonical on-disk string form.
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::DataIngestion => "data_ingestion",
            Phase::SignalGeneration => "signal_generation",
            Phase::RiskValidation => "risk_validation",
            Phase::OrderExecution => "order_execution",
        }
    }

    /// Parse the canonical string form.
    pub fn parse(s: &str) -> Result<Phase, Error> {
        match s {
            "data_ingestion" => Ok(Phase::DataIngestion),
            "signal_generation" => Ok(Phase::SignalGeneration),
            "risk_validation" => Ok(Phase::RiskValidation),
            "order_execution" => Ok(Phase::OrderExecution),
            _ => Err(Error::invalid_argument(format!("unknown phase '{s}'"))),
        }
    }

    /// Look up a phase by its frozen ordinal. `0` is the invalid sentinel
    /// and never resolves.
    pub fn from_ordinal(n: u64) -> Option<Phase> {
        match n {
            1 => Some(Phase::DataIngestion),
            2 => Some(Phase::SignalGeneration),
            3 => Some(Phase::RiskValidation),
            4 => Some(Phase::OrderExecution),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// True when a step at `from` may be followed by a step at `to`: the same
/// phase (intra-phase retry) or the immediate next phase. No skips, no
/// backward moves.
pub fn is_valid_transition(from: Phase, to: Phase) -> bool {
    to.ordinal() == from.ordinal() || to.ordinal() == from.ordinal() + 1
}

impl<'de> Deserialize<'de> for Phase {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PhaseVisitor;

        impl<'de> Visitor<'de> for PhaseVisitor {
            type Value = Phase;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a phase name or its numeric ordinal")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Phase, E> {
                Phase::parse(v).map_err(|_| de::Error::unknown_variant(v, &Phase::NAMES))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Phase, E> {
                Phase::from_ordinal(v)
                    .ok_or_else(|| de::Error::custom(format!("invalid phase ordinal {v}")))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Phase, E> {
                u64::try_from(v)
                    .ok()
                    .and_then(Phase::from_ordinal)
                    .ok_or_else(|| de::Error::custom(format!("invalid phase ordinal {v}")))
            }
        }

        deserializer.deserialize_any(PhaseVisitor)
    }
}
