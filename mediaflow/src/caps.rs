//! Capability descriptors and negotiation.
//!
//! A [`Capability`] names a media type (`video/x-raw`, `application/x-rtp`, ...)
//! and constrains a set of attributes. A [`CapabilitySet`] is the ordered list of
//! alternatives a port can produce or accept. Two descriptors are compatible when
//! their media types belong to the same family and every attribute they both
//! constrain has a non-empty intersection.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A constrained attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CapsValue {
    /// Unconstrained.
    Any,
    /// Exact integer.
    Int(i64),
    /// Inclusive integer range.
    IntRange {
        /// Lower bound.
        min: i64,
        /// Upper bound.
        max: i64,
    },
    /// Exact fraction (e.g. a framerate).
    Fraction(i32, i32),
    /// Exact string.
    Str(String),
}

impl CapsValue {
    /// Intersects two values, returning `None` when they are disjoint.
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        match (self, other) {
            (Self::Any, v) | (v, Self::Any) => Some(v.clone()),
            (Self::Int(a), Self::Int(b)) => (a == b).then(|| Self::Int(*a)),
            (Self::Int(v), Self::IntRange { min, max })
            | (Self::IntRange { min, max }, Self::Int(v)) => {
                (min <= v && v <= max).then(|| Self::Int(*v))
            }
            (
                Self::IntRange { min: a_min, max: a_max },
                Self::IntRange { min: b_min, max: b_max },
            ) => {
                let min = *a_min.max(b_min);
                let max = *a_max.min(b_max);
                match min.cmp(&max) {
                    std::cmp::Ordering::Less => Some(Self::IntRange { min, max }),
                    std::cmp::Ordering::Equal => Some(Self::Int(min)),
                    std::cmp::Ordering::Greater => None,
                }
            }
            (Self::Fraction(an, ad), Self::Fraction(bn, bd)) => {
                // compare as cross products so 30/1 == 60/2
                (i64::from(*an) * i64::from(*bd) == i64::from(*bn) * i64::from(*ad))
                    .then(|| Self::Fraction(*an, *ad))
            }
            (Self::Str(a), Self::Str(b)) => (a == b).then(|| Self::Str(a.clone())),
            _ => None,
        }
    }

    /// Returns true if the value denotes exactly one value.
    #[must_use]
    pub fn is_fixed(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Fraction(..) | Self::Str(_))
    }

    /// Returns the exact integer, if fixed to one.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the exact string, if fixed to one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the exact fraction, if fixed to one.
    #[must_use]
    pub fn as_fraction(&self) -> Option<(i32, i32)> {
        match self {
            Self::Fraction(n, d) => Some((*n, *d)),
            _ => None,
        }
    }

    fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("empty value".to_string());
        }
        if raw == "ANY" || raw == "*" {
            return Ok(Self::Any);
        }
        if let Some(inner) = raw.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
            let (min, max) = inner
                .split_once(',')
                .ok_or_else(|| format!("range '{raw}' needs two bounds"))?;
            let min = min.trim().parse::<i64>().map_err(|e| e.to_string())?;
            let max = max.trim().parse::<i64>().map_err(|e| e.to_string())?;
            if min > max {
                return Err(format!("range '{raw}' is empty"));
            }
            return Ok(Self::IntRange { min, max });
        }
        if let Ok(v) = raw.parse::<i64>() {
            return Ok(Self::Int(v));
        }
        if let Some((n, d)) = raw.split_once('/') {
            if let (Ok(n), Ok(d)) = (n.parse::<i32>(), d.parse::<i32>()) {
                if d == 0 {
                    return Err(format!("fraction '{raw}' has a zero denominator"));
                }
                return Ok(Self::Fraction(n, d));
            }
        }
        let unquoted = raw
            .strip_prefix('"')
            .and_then(|r| r.strip_suffix('"'))
            .unwrap_or(raw);
        Ok(Self::Str(unquoted.to_string()))
    }
}

impl fmt::Display for CapsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "ANY"),
            Self::Int(v) => write!(f, "{v}"),
            Self::IntRange { min, max } => write!(f, "[{min}, {max}]"),
            Self::Fraction(n, d) => write!(f, "{n}/{d}"),
            Self::Str(s) => write!(f, "{s}"),
        }
    }
}

/// A capability descriptor: a media type plus constrained attributes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Capability {
    media_type: String,
    fields: BTreeMap<String, CapsValue>,
}

impl Capability {
    /// Creates a descriptor with no attribute constraints.
    #[must_use]
    pub fn new(media_type: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Adds an attribute constraint.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: CapsValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Adds an exact integer attribute.
    #[must_use]
    pub fn with_int(self, name: impl Into<String>, value: i64) -> Self {
        self.with_field(name, CapsValue::Int(value))
    }

    /// Adds an inclusive integer range attribute.
    #[must_use]
    pub fn with_range(self, name: impl Into<String>, min: i64, max: i64) -> Self {
        self.with_field(name, CapsValue::IntRange { min, max })
    }

    /// Adds an exact string attribute.
    #[must_use]
    pub fn with_str(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.with_field(name, CapsValue::Str(value.into()))
    }

    /// Adds an exact fraction attribute.
    #[must_use]
    pub fn with_fraction(self, name: impl Into<String>, num: i32, den: i32) -> Self {
        self.with_field(name, CapsValue::Fraction(num, den))
    }

    /// Replaces (or inserts) an attribute, returning the previous value.
    pub fn set_field(&mut self, name: impl Into<String>, value: CapsValue) -> Option<CapsValue> {
        self.fields.insert(name.into(), value)
    }

    /// Returns the media type name.
    #[must_use]
    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// Returns an attribute constraint.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&CapsValue> {
        self.fields.get(name)
    }

    /// Returns an exact integer attribute.
    #[must_use]
    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(CapsValue::as_int)
    }

    /// Returns an exact string attribute.
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(CapsValue::as_str)
    }

    /// Returns an exact fraction attribute.
    #[must_use]
    pub fn get_fraction(&self, name: &str) -> Option<(i32, i32)> {
        self.get(name).and_then(CapsValue::as_fraction)
    }

    /// Iterates over attribute constraints in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &CapsValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns true if every attribute is fixed to a single value.
    #[must_use]
    pub fn is_fixed(&self) -> bool {
        self.fields.values().all(CapsValue::is_fixed)
    }

    /// Returns true if the media type starts with `family`.
    ///
    /// This is the policy used by lazy links: `video/x-raw` accepts any
    /// announced type whose name has that prefix.
    #[must_use]
    pub fn is_in_family(&self, family: &str) -> bool {
        self.media_type.starts_with(family)
    }

    /// Returns true if one media type is equal to, or a prefix of, the other.
    #[must_use]
    pub fn same_family(&self, other: &Self) -> bool {
        self.media_type.starts_with(&other.media_type)
            || other.media_type.starts_with(&self.media_type)
    }

    /// Intersects two descriptors.
    ///
    /// The result carries the more specific media type and the union of
    /// attributes, with shared attributes intersected.
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        if !self.same_family(other) {
            return None;
        }
        let media_type = if self.media_type.len() >= other.media_type.len() {
            self.media_type.clone()
        } else {
            other.media_type.clone()
        };
        let mut fields = self.fields.clone();
        for (name, theirs) in &other.fields {
            let merged = match fields.get(name) {
                Some(ours) => ours.intersect(theirs)?,
                None => theirs.clone(),
            };
            fields.insert(name.clone(), merged);
        }
        Some(Self { media_type, fields })
    }

    /// Returns true if the two descriptors intersect.
    #[must_use]
    pub fn is_compatible(&self, other: &Self) -> bool {
        self.intersect(other).is_some()
    }

    /// Fixes every unfixed attribute: ranges collapse to their minimum and
    /// unconstrained attributes are dropped.
    #[must_use]
    pub fn fixate(&self) -> Self {
        let fields = self
            .fields
            .iter()
            .filter_map(|(k, v)| match v {
                CapsValue::Any => None,
                CapsValue::IntRange { min, .. } => Some((k.clone(), CapsValue::Int(*min))),
                other => Some((k.clone(), other.clone())),
            })
            .collect();
        Self {
            media_type: self.media_type.clone(),
            fields,
        }
    }

    /// Parses `media/type, key=value, key=[min, max], key=n/d`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidCaps`] on malformed input.
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidCaps {
            input: input.to_string(),
            reason,
        };
        let mut parts = split_top_level(input).into_iter();
        let media_type = parts
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| invalid("missing media type".to_string()))?;
        if media_type.contains('=') {
            return Err(invalid("missing media type".to_string()));
        }
        let mut caps = Self::new(media_type);
        for part in parts {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| invalid(format!("expected key=value, got '{}'", part.trim())))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(invalid("empty attribute name".to_string()));
            }
            let value = CapsValue::parse(value).map_err(invalid)?;
            caps.fields.insert(key.to_string(), value);
        }
        Ok(caps)
    }
}

fn split_top_level(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.media_type)?;
        for (k, v) in &self.fields {
            write!(f, ", {k}={v}")?;
        }
        Ok(())
    }
}

impl TryFrom<String> for Capability {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Capability> for String {
    fn from(caps: Capability) -> Self {
        caps.to_string()
    }
}

impl std::str::FromStr for Capability {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// The ordered alternatives a port can produce or accept.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CapabilitySet {
    /// Anything is acceptable; the type is resolved at negotiation time.
    #[default]
    Any,
    /// One of the listed descriptors.
    OneOf(Vec<Capability>),
}

impl CapabilitySet {
    /// The unconstrained set.
    #[must_use]
    pub fn any() -> Self {
        Self::Any
    }

    /// A set containing a single descriptor.
    #[must_use]
    pub fn single(caps: Capability) -> Self {
        Self::OneOf(vec![caps])
    }

    /// Returns true for the unconstrained set.
    #[must_use]
    pub fn is_any(&self) -> bool {
        matches!(self, Self::Any)
    }

    /// Returns the first alternative, or `None` for the unconstrained set.
    #[must_use]
    pub fn first(&self) -> Option<&Capability> {
        match self {
            Self::Any => None,
            Self::OneOf(list) => list.first(),
        }
    }

    /// Returns true if `caps` intersects at least one alternative.
    #[must_use]
    pub fn accepts(&self, caps: &Capability) -> bool {
        match self {
            Self::Any => true,
            Self::OneOf(list) => list.iter().any(|c| c.is_compatible(caps)),
        }
    }

    /// Intersects `caps` with the first compatible alternative.
    #[must_use]
    pub fn intersect_one(&self, caps: &Capability) -> Option<Capability> {
        match self {
            Self::Any => Some(caps.clone()),
            Self::OneOf(list) => list.iter().find_map(|c| c.intersect(caps)),
        }
    }

    /// Intersects two sets, keeping the order of `self`.
    ///
    /// An empty `OneOf` is the empty set and accepts nothing.
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Any, set) | (set, Self::Any) => set.clone(),
            (Self::OneOf(ours), Self::OneOf(_)) => {
                Self::OneOf(ours.iter().filter_map(|c| other.intersect_one(c)).collect())
            }
        }
    }

    /// Returns true for a set with no alternatives.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::OneOf(list) if list.is_empty())
    }

    /// Returns true if any pair of alternatives intersects.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Any, _) | (_, Self::Any) => true,
            (Self::OneOf(ours), Self::OneOf(_)) => ours.iter().any(|c| other.accepts(c)),
        }
    }
}

impl From<Capability> for CapabilitySet {
    fn from(caps: Capability) -> Self {
        Self::single(caps)
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "ANY"),
            Self::OneOf(list) => {
                let rendered: Vec<String> = list.iter().map(ToString::to_string).collect();
                write!(f, "{}", rendered.join("; "))
            }
        }
    }
}

/// Raw video family.
pub const RAW_VIDEO: &str = "video/x-raw";
/// Raw audio family.
pub const RAW_AUDIO: &str = "audio/x-raw";
/// Encoded H.264 video.
pub const H264: &str = "video/x-h264";
/// RTP packets.
pub const RTP: &str = "application/x-rtp";
