//! Feature gates
//!
//! Parsed from a `--feature-gates` flag of the form
//! `NativeSidecar=true,InPlaceOrRecreate=false`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const NATIVE_SIDECAR: &str = "NativeSidecar";
pub const IN_PLACE_OR_RECREATE: &str = "InPlaceOrRecreate";

/// Optional behaviors, all off by default
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureGates {
    /// Patch init containers with `restartPolicy: Always`
    pub native_sidecar: bool,
    /// Accept and act on the `InPlaceOrRecreate` update mode
    pub in_place_or_recreate: bool,
}

impl FeatureGates {
    pub fn parse(input: &str) -> Result<Self> {
        let mut gates = Self::default();
        for entry in input.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, value) = entry
                .split_once('=')
                .ok_or_else(|| Error::config(format!("missing bool value for {}", entry)))?;
            let enabled: bool = value
                .trim()
                .parse()
                .map_err(|_| Error::config(format!("invalid value of {}: {}", name, value)))?;
            match name.trim() {
                NATIVE_SIDECAR => gates.native_sidecar = enabled,
                IN_PLACE_OR_RECREATE => gates.in_place_or_recreate = enabled,
                other => return Err(Error::config(format!("unrecognized feature gate: {}", other))),
            }
        }
        Ok(gates)
    }
}

impl FromStr for FeatureGates {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for FeatureGates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}={},{}={}",
            IN_PLACE_OR_RECREATE, self.in_place_or_recreate, NATIVE_SIDECAR, self.native_sidecar
        )
    }
}
