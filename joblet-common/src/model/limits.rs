// Copyright 2024-2025 Joblet Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::SafeDisplay;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;
const GB: u64 = 1024 * MB;

/// Hard upper bound on a job's memory limit.
pub const MAX_MEMORY: MemorySize = MemorySize(32 * GB);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LimitError {
    #[error("invalid memory size: {0:?}")]
    InvalidMemorySize(String),
    #[error("invalid CPU percentage: {0:?}")]
    InvalidCpuPercent(String),
    #[error("invalid CPU core set: {0:?}")]
    InvalidCoreSet(String),
    #[error("invalid IO bandwidth: {0:?}")]
    InvalidBandwidth(String),
    #[error("memory limit {0} exceeds the {1} maximum")]
    MemoryLimitTooLarge(MemorySize, MemorySize),
}

impl SafeDisplay for LimitError {
    fn to_safe_string(&self) -> String {
        self.to_string()
    }
}

fn parse_byte_size(s: &str) -> Option<u64> {
    let s = s.trim();
    let (digits, multiplier) = if let Some(rest) = s.strip_suffix("GB") {
        (rest, GB)
    } else if let Some(rest) = s.strip_suffix("MB") {
        (rest, MB)
    } else if let Some(rest) = s.strip_suffix("KB") {
        (rest, KB)
    } else if let Some(rest) = s.strip_suffix('B') {
        (rest, 1)
    } else {
        (s, 1)
    };
    let value: u64 = digits.trim().parse().ok()?;
    value.checked_mul(multiplier)
}

fn display_byte_size(bytes: u64, f: &mut Formatter<'_>) -> fmt::Result {
    if bytes == 0 {
        write!(f, "0B")
    } else if bytes % GB == 0 {
        write!(f, "{}GB", bytes / GB)
    } else if bytes % MB == 0 {
        write!(f, "{}MB", bytes / MB)
    } else if bytes % KB == 0 {
        write!(f, "{}KB", bytes / KB)
    } else {
        write!(f, "{bytes}B")
    }
}

/// Memory size in bytes; 0 means unlimited. Parses `B|KB|MB|GB`
/// suffixes with binary (1024) multipliers.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MemorySize(pub u64);

impl MemorySize {
    pub fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> u64 {
        self.0
    }

    pub fn is_unlimited(&self) -> bool {
        self.0 == 0
    }

    pub fn validate_limit(&self) -> Result<(), LimitError> {
        if self.0 > MAX_MEMORY.0 {
            Err(LimitError::MemoryLimitTooLarge(*self, MAX_MEMORY))
        } else {
            Ok(())
        }
    }
}

impl Display for MemorySize {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        display_byte_size(self.0, f)
    }
}

impl FromStr for MemorySize {
    type Err = LimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_byte_size(s)
            .map(MemorySize)
            .ok_or_else(|| LimitError::InvalidMemorySize(s.to_string()))
    }
}

/// CPU limit as a percentage of a single core; 0 means unlimited,
/// values above 100 span multiple cores.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CpuPercent(pub u32);

impl CpuPercent {
    pub fn from_percent(value: u32) -> Self {
        Self(value)
    }

    pub fn as_percent(&self) -> u32 {
        self.0
    }

    pub fn is_unlimited(&self) -> bool {
        self.0 == 0
    }
}

impl Display for CpuPercent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CpuPercent {
    type Err = LimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().strip_suffix('%').unwrap_or(s.trim());
        let value: i64 = digits
            .trim()
            .parse()
            .map_err(|_| LimitError::InvalidCpuPercent(s.to_string()))?;
        if !(0..=i64::from(u32::MAX)).contains(&value) {
            return Err(LimitError::InvalidCpuPercent(s.to_string()));
        }
        Ok(CpuPercent(value as u32))
    }
}

/// A set of CPU indices a job is pinned to; empty means no pinning.
/// Parses comma-separated indices and ranges (`"0-3,7"`), displayed in
/// the same canonical range form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CpuCoreSet(BTreeSet<u32>);

impl CpuCoreSet {
    pub fn new(cores: impl IntoIterator<Item = u32>) -> Self {
        Self(cores.into_iter().collect())
    }

    pub fn is_unlimited(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, core: u32) -> bool {
        self.0.contains(&core)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().copied()
    }

    pub fn max_core(&self) -> Option<u32> {
        self.0.iter().next_back().copied()
    }
}

impl Display for CpuCoreSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut cores = self.0.iter().copied().peekable();
        while let Some(start) = cores.next() {
            let mut end = start;
            while cores.peek() == Some(&(end + 1)) {
                end = cores.next().unwrap();
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;
            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }
        Ok(())
    }
}

impl FromStr for CpuCoreSet {
    type Err = LimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(CpuCoreSet::default());
        }
        let mut cores = BTreeSet::new();
        for part in trimmed.split(',') {
            let part = part.trim();
            match part.split_once('-') {
                Some((start, end)) => {
                    let start: u32 = start
                        .trim()
                        .parse()
                        .map_err(|_| LimitError::InvalidCoreSet(s.to_string()))?;
                    let end: u32 = end
                        .trim()
                        .parse()
                        .map_err(|_| LimitError::InvalidCoreSet(s.to_string()))?;
                    if start > end {
                        return Err(LimitError::InvalidCoreSet(s.to_string()));
                    }
                    cores.extend(start..=end);
                }
                None => {
                    let core: u32 = part
                        .parse()
                        .map_err(|_| LimitError::InvalidCoreSet(s.to_string()))?;
                    cores.insert(core);
                }
            }
        }
        Ok(CpuCoreSet(cores))
    }
}

impl Serialize for CpuCoreSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CpuCoreSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        CpuCoreSet::from_str(&s).map_err(D::Error::custom)
    }
}

/// IO bandwidth in bytes per second; 0 means unlimited. Accepts the
/// same byte-size suffixes as [`MemorySize`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct IoBandwidth(pub u64);

impl IoBandwidth {
    pub fn from_bytes_per_sec(value: u64) -> Self {
        Self(value)
    }

    pub fn as_bytes_per_sec(&self) -> u64 {
        self.0
    }

    pub fn is_unlimited(&self) -> bool {
        self.0 == 0
    }
}

impl Display for IoBandwidth {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        display_byte_size(self.0, f)
    }
}

impl FromStr for IoBandwidth {
    type Err = LimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_byte_size(s)
            .map(IoBandwidth)
            .ok_or_else(|| LimitError::InvalidBandwidth(s.to_string()))
    }
}

/// The four resource limits attached to a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default)]
    pub cpu: CpuPercent,
    #[serde(default)]
    pub cores: CpuCoreSet,
    #[serde(default)]
    pub memory: MemorySize,
    #[serde(default)]
    pub io_bandwidth: IoBandwidth,
}

impl ResourceLimits {
    pub fn is_unlimited(&self) -> bool {
        self.cpu.is_unlimited()
            && self.cores.is_unlimited()
            && self.memory.is_unlimited()
            && self.io_bandwidth.is_unlimited()
    }

    pub fn validate(&self) -> Result<(), LimitError> {
        self.memory.validate_limit()
    }
}

impl SafeDisplay for ResourceLimits {
    fn to_safe_string(&self) -> String {
        format!(
            "cpu: {}, cores: {}, memory: {}, io: {}",
            self.cpu, self.cores, self.memory, self.io_bandwidth
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use test_r::test;

    #[test]
    fn memory_size_parses_binary_suffixes() {
        assert_eq!("512MB".parse(), Ok(MemorySize(512 * MB)));
        assert_eq!("2GB".parse(), Ok(MemorySize(2 * GB)));
        assert_eq!("1024KB".parse(), Ok(MemorySize(MB)));
        assert_eq!("17B".parse(), Ok(MemorySize(17)));
        assert_eq!("0".parse(), Ok(MemorySize(0)));
        assert!("1.5GB".parse::<MemorySize>().is_err());
        assert!("twelve".parse::<MemorySize>().is_err());
        assert!("-1MB".parse::<MemorySize>().is_err());
    }

    #[test]
    fn memory_limit_enforces_maximum() {
        assert!(MemorySize(32 * GB).validate_limit().is_ok());
        assert_eq!(
            MemorySize(32 * GB + 1).validate_limit(),
            Err(LimitError::MemoryLimitTooLarge(
                MemorySize(32 * GB + 1),
                MAX_MEMORY
            ))
        );
    }

    #[test]
    fn core_set_parses_ranges() {
        let cores: CpuCoreSet = "0-3,7".parse().unwrap();
        assert_eq!(cores, CpuCoreSet::new([0, 1, 2, 3, 7]));
        assert_eq!(cores.to_string(), "0-3,7");
        assert!("3-1".parse::<CpuCoreSet>().is_err());
        assert!("a-b".parse::<CpuCoreSet>().is_err());
        assert!("".parse::<CpuCoreSet>().unwrap().is_unlimited());
    }

    #[test]
    fn cpu_percent_rejects_negatives() {
        assert_eq!("150".parse(), Ok(CpuPercent(150)));
        assert_eq!("150%".parse(), Ok(CpuPercent(150)));
        assert!("-5".parse::<CpuPercent>().is_err());
        assert!("".parse::<CpuPercent>().is_err());
    }

    #[test]
    fn parse_display_round_trip() {
        let mut rng = StdRng::seed_from_u64(20240811);
        for _ in 0..1000 {
            let memory = MemorySize(rng.random_range(0..4 * GB));
            assert_eq!(memory.to_string().parse(), Ok(memory));

            let bandwidth = IoBandwidth(rng.random_range(0..GB));
            assert_eq!(bandwidth.to_string().parse(), Ok(bandwidth));

            let cpu = CpuPercent(rng.random_range(0..1600));
            assert_eq!(cpu.to_string().parse(), Ok(cpu));

            let core_count = rng.random_range(0..16);
            let cores = CpuCoreSet::new((0..core_count).map(|_| rng.random_range(0..64u32)));
            assert_eq!(cores.to_string().parse(), Ok(cores));
        }
    }
}
