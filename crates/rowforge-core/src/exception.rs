//! Row-level exception codes, records and per-operator tallies.
//!
//! Codes have a stable integer and name so resolvers and ignore rules can be
//! written either way (`resolve: { code: ValueError }` or `code: 2`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::id::OpId;
use crate::types::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExceptionCode {
    TypeError,
    ValueError,
    ZeroDivisionError,
    OverflowError,
    KeyError,
    IndexError,
    NullError,
    /// A compiled fast-path type assumption did not hold for this row.
    NormalCaseViolation,
    /// The row belonged to a remote partition that failed after all retries.
    PartitionFailure,
}

impl ExceptionCode {
    pub const ALL: [ExceptionCode; 9] = [
        ExceptionCode::TypeError,
        ExceptionCode::ValueError,
        ExceptionCode::ZeroDivisionError,
        ExceptionCode::OverflowError,
        ExceptionCode::KeyError,
        ExceptionCode::IndexError,
        ExceptionCode::NullError,
        ExceptionCode::NormalCaseViolation,
        ExceptionCode::PartitionFailure,
    ];

    pub const fn code(self) -> i64 {
        match self {
            ExceptionCode::TypeError => 1,
            ExceptionCode::ValueError => 2,
            ExceptionCode::ZeroDivisionError => 3,
            ExceptionCode::OverflowError => 4,
            ExceptionCode::KeyError => 5,
            ExceptionCode::IndexError => 6,
            ExceptionCode::NullError => 7,
            ExceptionCode::NormalCaseViolation => 100,
            ExceptionCode::PartitionFailure => 101,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            ExceptionCode::TypeError => "TypeError",
            ExceptionCode::ValueError => "ValueError",
            ExceptionCode::ZeroDivisionError => "ZeroDivisionError",
            ExceptionCode::OverflowError => "OverflowError",
            ExceptionCode::KeyError => "KeyError",
            ExceptionCode::IndexError => "IndexError",
            ExceptionCode::NullError => "NullError",
            ExceptionCode::NormalCaseViolation => "NormalCaseViolation",
            ExceptionCode::PartitionFailure => "PartitionFailure",
        }
    }

    pub fn from_code(code: i64) -> Option<ExceptionCode> {
        Self::ALL.iter().copied().find(|c| c.code() == code)
    }

    /// Internal codes are produced by the engine itself, never by user code.
    pub fn is_internal(self) -> bool {
        matches!(
            self,
            ExceptionCode::NormalCaseViolation | ExceptionCode::PartitionFailure
        )
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ExceptionCode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(n) = s.parse::<i64>() {
            return Self::from_code(n).ok_or_else(|| Error::UnknownExceptionCode(s.to_string()));
        }
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::UnknownExceptionCode(s.to_string()))
    }
}

/// Position of a row in the job input: partition index, then row index in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowOrdinal {
    pub partition: usize,
    pub row: u64,
}

/// One unresolved row, kept in full so callers can inspect it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub op: OpId,
    pub code: ExceptionCode,
    pub ordinal: RowOrdinal,
    /// The row as it was handed to the failing operator.
    pub row: Row,
}

/// Counts keyed by (operator, code).
pub type TallyMap = BTreeMap<(OpId, ExceptionCode), u64>;

/// Per-operator, per-code outcome counts for one partition or a whole job.
///
/// Tallies are built per partition and merged when the partition completes;
/// merge is commutative so completion order never matters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExceptionTally {
    pub unresolved: TallyMap,
    pub resolved: TallyMap,
    pub ignored: TallyMap,
    /// Rows that violated a fast-path assumption but succeeded on the interpreter.
    pub general_path: TallyMap,
}

impl ExceptionTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_unresolved(&mut self, op: OpId, code: ExceptionCode, n: u64) {
        bump(&mut self.unresolved, op, code, n);
    }

    pub fn add_resolved(&mut self, op: OpId, code: ExceptionCode, n: u64) {
        bump(&mut self.resolved, op, code, n);
    }

    pub fn add_ignored(&mut self, op: OpId, code: ExceptionCode, n: u64) {
        bump(&mut self.ignored, op, code, n);
    }

    pub fn add_general_path(&mut self, op: OpId, n: u64) {
        bump(&mut self.general_path, op, ExceptionCode::NormalCaseViolation, n);
    }

    pub fn merge(&mut self, other: &ExceptionTally) {
        merge_map(&mut self.unresolved, &other.unresolved);
        merge_map(&mut self.resolved, &other.resolved);
        merge_map(&mut self.ignored, &other.ignored);
        merge_map(&mut self.general_path, &other.general_path);
    }

    pub fn total_unresolved(&self) -> u64 {
        self.unresolved.values().sum()
    }

    pub fn total_resolved(&self) -> u64 {
        self.resolved.values().sum()
    }

    pub fn total_ignored(&self) -> u64 {
        self.ignored.values().sum()
    }

    pub fn total_general_path(&self) -> u64 {
        self.general_path.values().sum()
    }

    /// Unresolved counts folded by code name.
    pub fn unresolved_by_code(&self) -> BTreeMap<String, u64> {
        let mut out = BTreeMap::new();
        for ((_, code), n) in &self.unresolved {
            *out.entry(code.name().to_string()).or_insert(0) += n;
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.unresolved.is_empty()
            && self.resolved.is_empty()
            && self.ignored.is_empty()
            && self.general_path.is_empty()
    }
}

fn bump(map: &mut TallyMap, op: OpId, code: ExceptionCode, n: u64) {
    if n > 0 {
        *map.entry((op, code)).or_insert(0) += n;
    }
}

fn merge_map(into: &mut TallyMap, from: &TallyMap) {
    for (k, v) in from {
        *into.entry(*k).or_insert(0) += v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_parse_by_name_or_number() {
        assert_eq!(
            "ValueError".parse::<ExceptionCode>().unwrap(),
            ExceptionCode::ValueError
        );
        assert_eq!(
            "zerodivisionerror".parse::<ExceptionCode>().unwrap(),
            ExceptionCode::ZeroDivisionError
        );
        assert_eq!("1".parse::<ExceptionCode>().unwrap(), ExceptionCode::TypeError);
        assert!("Nope".parse::<ExceptionCode>().is_err());
        assert!("42".parse::<ExceptionCode>().is_err());
    }

    #[test]
    fn codes_are_stable_and_unique() {
        let mut seen = std::collections::HashSet::new();
        for c in ExceptionCode::ALL {
            assert!(seen.insert(c.code()));
            assert_eq!(ExceptionCode::from_code(c.code()), Some(c));
        }
    }

    #[test]
    fn merge_is_commutative() {
        let op = OpId::new(1);
        let mut a = ExceptionTally::new();
        a.add_unresolved(op, ExceptionCode::TypeError, 2);
        a.add_ignored(op, ExceptionCode::ValueError, 1);
        let mut b = ExceptionTally::new();
        b.add_unresolved(op, ExceptionCode::TypeError, 3);
        b.add_resolved(op, ExceptionCode::KeyError, 4);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab, ba);
        assert_eq!(ab.total_unresolved(), 5);
        assert_eq!(ab.unresolved_by_code().get("TypeError"), Some(&5));
    }

    #[test]
    fn zero_counts_are_not_recorded() {
        let mut t = ExceptionTally::new();
        t.add_ignored(OpId::new(1), ExceptionCode::TypeError, 0);
        assert!(t.is_empty());
    }
}
