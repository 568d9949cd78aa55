//! External tool table.
//!
//! Tools are looked up by name and an optional `major[.minor[.patch]]`
//! requirement; the highest matching version wins.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{RunError, Result};

/// A tool version. Missing components act as wildcards when used as a
/// requirement and as zero when comparing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ToolVersion {
    pub major: u32,
    pub minor: Option<u32>,
    pub patch: Option<u32>,
}

impl ToolVersion {
    pub fn new(major: u32, minor: Option<u32>, patch: Option<u32>) -> Self {
        Self { major, minor, patch }
    }

    /// True if `self` satisfies `requirement`.
    pub fn matches(&self, requirement: &ToolVersion) -> bool {
        fn component(have: Option<u32>, want: Option<u32>) -> bool {
            match want {
                None => true,
                Some(w) => have == Some(w),
            }
        }
        self.major == requirement.major
            && component(self.minor, requirement.minor)
            && component(self.patch, requirement.patch)
    }

    fn key(&self) -> (u32, u32, u32) {
        (self.major, self.minor.unwrap_or(0), self.patch.unwrap_or(0))
    }
}

impl PartialOrd for ToolVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ToolVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for ToolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.major)?;
        if let Some(minor) = self.minor {
            write!(f, ".{}", minor)?;
            if let Some(patch) = self.patch {
                write!(f, ".{}", patch)?;
            }
        }
        Ok(())
    }
}

impl FromStr for ToolVersion {
    type Err = RunError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || RunError::invalid_parameter("tool_version", format!("'{}' is not a version", s));
        let mut parts = s.trim().split('.');
        let mut next = |required: bool| -> Result<Option<u32>> {
            match parts.next() {
                None if !required => Ok(None),
                None => Err(invalid()),
                Some(p) => p.parse::<u32>().map(Some).map_err(|_| invalid()),
            }
        };
        let major = next(true)?.ok_or_else(invalid)?;
        let minor = next(false)?;
        let patch = next(false)?;
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self { major, minor, patch })
    }
}

impl TryFrom<String> for ToolVersion {
    type Error = RunError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ToolVersion> for String {
    fn from(version: ToolVersion) -> Self {
        version.to_string()
    }
}

/// One executable known to the tool table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<ToolVersion>,
    pub path: PathBuf,
}

impl ToolInfo {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            version: None,
            path: path.into(),
        }
    }

    pub fn with_version(mut self, version: ToolVersion) -> Self {
        self.version = Some(version);
        self
    }
}

/// Read-only mapping from tool name (and version) to executable.
#[derive(Debug, Clone, Default)]
pub struct ToolTable {
    tools: Vec<ToolInfo>,
}

impl ToolTable {
    pub fn new(tools: impl IntoIterator<Item = ToolInfo>) -> Self {
        Self {
            tools: tools.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn tools(&self) -> &[ToolInfo] {
        &self.tools
    }

    /// Highest-versioned tool named `name` satisfying `requirement`.
    ///
    /// Unversioned tools match only when no requirement is given.
    pub fn find(&self, name: &str, requirement: Option<&ToolVersion>) -> Option<&ToolInfo> {
        self.tools
            .iter()
            .filter(|t| t.name.eq_ignore_ascii_case(name))
            .filter(|t| match (requirement, &t.version) {
                (None, _) => true,
                (Some(req), Some(have)) => have.matches(req),
                (Some(_), None) => false,
            })
            .max_by(|a, b| a.version.cmp(&b.version))
    }

    /// Layer `local` entries in front of this table.
    pub fn layered<'a>(&'a self, local: &'a [ToolInfo]) -> LayeredTools<'a> {
        LayeredTools { local, global: self }
    }
}

/// Job-local tools consulted before the scheduler-wide table.
#[derive(Debug, Clone, Copy)]
pub struct LayeredTools<'a> {
    local: &'a [ToolInfo],
    global: &'a ToolTable,
}

impl LayeredTools<'_> {
    pub fn find(&self, name: &str, requirement: Option<&ToolVersion>) -> Option<ToolInfo> {
        let local = ToolTable::new(self.local.iter().cloned());
        local
            .find(name, requirement)
            .or_else(|| self.global.find(name, requirement))
            .cloned()
    }
}
