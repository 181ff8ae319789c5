//! Processing methods and their parameter schema.

use core::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use segq_core::{DomainError, DomainResult, ValueObject};

/// Segmentation algorithm family.
///
/// Closed set: adding a method is a compile-time change that every exhaustive
/// `match` (queue routing, cost class) has to acknowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// GrabCut with optional preprocessing. Light.
    GrabCut,
    /// Segment Anything. CPU-heavy, no preprocessing.
    Sam,
}

/// Relative resource cost of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostClass {
    Light,
    Heavy,
}

impl Method {
    pub const ALL: [Method; 2] = [Method::GrabCut, Method::Sam];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GrabCut => "grabcut",
            Method::Sam => "sam",
        }
    }

    pub fn cost_class(&self) -> CostClass {
        match self {
            Method::GrabCut => CostClass::Light,
            Method::Sam => CostClass::Heavy,
        }
    }

    /// Whether the method honours white balance / gamma preprocessing.
    pub fn supports_preprocessing(&self) -> bool {
        matches!(self, Method::GrabCut)
    }
}

impl core::fmt::Display for Method {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grabcut" => Ok(Method::GrabCut),
            "sam" => Ok(Method::Sam),
            other => Err(DomainError::validation(format!("unknown method '{other}'"))),
        }
    }
}

/// White balance preprocessing mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhiteBalance {
    #[default]
    None,
    Grayworld,
}

impl FromStr for WhiteBalance {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(WhiteBalance::None),
            "grayworld" => Ok(WhiteBalance::Grayworld),
            other => Err(DomainError::validation(format!(
                "white_balance must be 'none' or 'grayworld', got '{other}'"
            ))),
        }
    }
}

/// Validated, method-normalised segmentation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationParams {
    pub white_balance: WhiteBalance,
    pub gamma: f64,
    /// Repetition count; scales CPU cost linearly.
    pub repeat: u32,
}

impl ValueObject for SegmentationParams {}

impl Default for SegmentationParams {
    fn default() -> Self {
        Self {
            white_balance: WhiteBalance::None,
            gamma: 1.0,
            repeat: Self::DEFAULT_REPEAT,
        }
    }
}

impl SegmentationParams {
    pub const MIN_REPEAT: u32 = 1;
    pub const MAX_REPEAT: u32 = 64;
    pub const DEFAULT_REPEAT: u32 = 8;

    /// Validate an opaque key/value payload against `method`'s schema.
    ///
    /// Missing keys take defaults, unknown keys are ignored. A `method` key,
    /// when present, must agree with the job's method.
    pub fn parse(method: Method, raw: &Value) -> DomainResult<Self> {
        let empty = Map::new();
        let fields = match raw {
            Value::Null => &empty,
            Value::Object(map) => map,
            _ => return Err(DomainError::validation("params must be an object")),
        };

        if let Some(tag) = fields.get("method") {
            let tag = tag
                .as_str()
                .ok_or_else(|| DomainError::validation("params.method must be a string"))?;
            if tag.parse::<Method>()? != method {
                return Err(DomainError::validation(format!(
                    "params.method '{tag}' does not match job method '{method}'"
                )));
            }
        }

        let white_balance = match fields.get("white_balance") {
            None | Some(Value::Null) => WhiteBalance::None,
            Some(Value::String(s)) => s.parse()?,
            Some(_) => return Err(DomainError::validation("white_balance must be a string")),
        };

        let gamma = match fields.get("gamma") {
            None | Some(Value::Null) => 1.0,
            Some(v) => v
                .as_f64()
                .ok_or_else(|| DomainError::validation("gamma must be a number"))?,
        };
        if !gamma.is_finite() || gamma <= 0.0 {
            return Err(DomainError::validation("gamma must be a positive finite number"));
        }

        let repeat = match fields.get("repeat") {
            None | Some(Value::Null) => Self::DEFAULT_REPEAT,
            Some(v) => {
                let n = v
                    .as_u64()
                    .ok_or_else(|| DomainError::validation("repeat must be a non-negative integer"))?;
                u32::try_from(n).unwrap_or(u32::MAX)
            }
        };
        if !(Self::MIN_REPEAT..=Self::MAX_REPEAT).contains(&repeat) {
            return Err(DomainError::validation(format!(
                "repeat must be within [{}, {}], got {repeat}",
                Self::MIN_REPEAT,
                Self::MAX_REPEAT
            )));
        }

        let params = Self {
            white_balance,
            gamma,
            repeat,
        };
        Ok(params.normalized_for(method))
    }

    /// Drop preprocessing the method ignores.
    pub fn normalized_for(mut self, method: Method) -> Self {
        if !method.supports_preprocessing() {
            self.white_balance = WhiteBalance::None;
            self.gamma = 1.0;
        }
        self
    }
}
