use crate::weaver::api::types::BundleConditionType;
use std::fmt::{Display, Formatter};

impl BundleConditionType {
    pub const fn as_str(self) -> &'static str {
        match self {
            BundleConditionType::InProgress => "InProgress",
            BundleConditionType::Ready => "Ready",
            BundleConditionType::Error => "Error",
        }
    }
}

impl Display for BundleConditionType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable reasons emitted with the `Error` condition.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BundleConditionReason {
    /// A retry is expected to resolve the failure.
    RetriableError,
    /// The Bundle requires user intervention.
    TerminalError,
}

impl BundleConditionReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            BundleConditionReason::RetriableError => "RetriableError",
            BundleConditionReason::TerminalError => "TerminalError",
        }
    }
}

impl Display for BundleConditionReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
