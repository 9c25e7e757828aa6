//! Resource quantities and resource lists.
//!
//! Quantities use Kubernetes notation so pod specs and configuration read the
//! same way the control plane writes them: CPU as cores or millicores
//! (`"2"`, `"500m"`, `"0.25"`), memory as bytes with binary (`Ki`, `Mi`, `Gi`,
//! ...) or decimal (`k`, `M`, `G`, ...) suffixes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuantityError {
    #[error("quantity cannot be empty")]
    Empty,

    #[error("invalid quantity '{0}'")]
    Invalid(String),
}

const BINARY_SUFFIXES: [(&str, u64); 6] = [
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("Pi", 1 << 50),
    ("Ei", 1 << 60),
];

const DECIMAL_SUFFIXES: [(&str, u64); 6] = [
    ("k", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
    ("P", 1_000_000_000_000_000),
    ("E", 1_000_000_000_000_000_000),
];

fn parse_scaled(raw: &str, number: &str, scale: f64) -> Result<u64, QuantityError> {
    let value: f64 = number
        .parse()
        .map_err(|_| QuantityError::Invalid(raw.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(QuantityError::Invalid(raw.to_string()));
    }
    let scaled = (value * scale).round();
    if scaled > u64::MAX as f64 {
        return Err(QuantityError::Invalid(raw.to_string()));
    }
    Ok(scaled as u64)
}

// =============================================================================
// CPU
// =============================================================================

/// CPU amount in millicores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cpu(u64);

impl Cpu {
    pub const ZERO: Cpu = Cpu(0);

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub const fn from_cores(cores: u64) -> Self {
        Self(cores * 1000)
    }

    pub const fn millis(&self) -> u64 {
        self.0
    }
}

impl FromStr for Cpu {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(QuantityError::Empty);
        }
        match s.strip_suffix('m') {
            Some(millis) => parse_scaled(s, millis, 1.0).map(Cpu),
            None => parse_scaled(s, s, 1000.0).map(Cpu),
        }
    }
}

impl fmt::Display for Cpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 1000 == 0 {
            write!(f, "{}", self.0 / 1000)
        } else {
            write!(f, "{}m", self.0)
        }
    }
}

// =============================================================================
// Memory
// =============================================================================

/// Memory amount in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Memory(u64);

impl Memory {
    pub const ZERO: Memory = Memory(0);

    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub const fn from_mebibytes(mib: u64) -> Self {
        Self(mib << 20)
    }

    pub const fn from_gibibytes(gib: u64) -> Self {
        Self(gib << 30)
    }

    pub const fn bytes(&self) -> u64 {
        self.0
    }
}

impl FromStr for Memory {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(QuantityError::Empty);
        }
        for (suffix, multiplier) in BINARY_SUFFIXES.iter().chain(DECIMAL_SUFFIXES.iter()) {
            if let Some(number) = s.strip_suffix(suffix) {
                return parse_scaled(s, number, *multiplier as f64).map(Memory);
            }
        }
        parse_scaled(s, s, 1.0).map(Memory)
    }
}

impl fmt::Display for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("0");
        }
        for (suffix, multiplier) in BINARY_SUFFIXES.iter().rev() {
            if self.0 % multiplier == 0 {
                return write!(f, "{}{}", self.0 / multiplier, suffix);
            }
        }
        write!(f, "{}", self.0)
    }
}

// Both quantities travel as strings but also accept bare JSON numbers.

#[derive(Deserialize)]
#[serde(untagged)]
enum RawQuantity {
    Text(String),
    Number(serde_json::Number),
}

impl RawQuantity {
    fn into_text(self) -> String {
        match self {
            RawQuantity::Text(s) => s,
            RawQuantity::Number(n) => n.to_string(),
        }
    }
}

macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = RawQuantity::deserialize(deserializer)?.into_text();
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(Cpu);
string_serde!(Memory);

// =============================================================================
// Resource List
// =============================================================================

/// A set of schedulable resources (node capacity, allocatable, or a request).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceList {
    #[serde(default)]
    pub cpu: Cpu,
    #[serde(default)]
    pub memory: Memory,
    #[serde(default)]
    pub pods: u64,
}

impl ResourceList {
    pub fn new(cpu: Cpu, memory: Memory, pods: u64) -> Self {
        Self { cpu, memory, pods }
    }

    /// True when every compute dimension of `self` fits inside `limit`.
    ///
    /// The pod count is not compared; it is admitted separately.
    pub fn fits_within(&self, limit: &ResourceList) -> bool {
        self.cpu <= limit.cpu && self.memory <= limit.memory
    }

    /// Names of the compute dimensions where `self` exceeds `limit`.
    pub fn exceeded(&self, limit: &ResourceList) -> Vec<String> {
        let mut exceeded = Vec::new();
        if self.cpu > limit.cpu {
            exceeded.push(format!("cpu {} > {}", self.cpu, limit.cpu));
        }
        if self.memory > limit.memory {
            exceeded.push(format!("memory {} > {}", self.memory, limit.memory));
        }
        exceeded
    }

    pub fn saturating_sub(&self, other: &ResourceList) -> ResourceList {
        ResourceList {
            cpu: Cpu(self.cpu.0.saturating_sub(other.cpu.0)),
            memory: Memory(self.memory.0.saturating_sub(other.memory.0)),
            pods: self.pods.saturating_sub(other.pods),
        }
    }

    pub fn saturating_add(&self, other: &ResourceList) -> ResourceList {
        ResourceList {
            cpu: Cpu(self.cpu.0.saturating_add(other.cpu.0)),
            memory: Memory(self.memory.0.saturating_add(other.memory.0)),
            pods: self.pods.saturating_add(other.pods),
        }
    }
}

impl std::iter::Sum for ResourceList {
    fn sum<I: Iterator<Item = ResourceList>>(iter: I) -> Self {
        iter.fold(ResourceList::default(), |acc, r| acc.saturating_add(&r))
    }
}
