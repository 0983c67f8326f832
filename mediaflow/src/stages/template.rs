//! Port templates declared by stages.

use crate::caps::{Capability, CapabilitySet};
use crate::core::{PadDirection, PadPresence};

/// Describes a port a stage has, or may announce later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortTemplate {
    /// Port name; `%u` marks a numbered family of announced ports.
    pub name: String,
    /// Input or output.
    pub direction: PadDirection,
    /// Created with the stage, or announced at runtime.
    pub presence: PadPresence,
    /// What the port can carry.
    pub caps: CapabilitySet,
}

impl PortTemplate {
    /// An always-present input port.
    #[must_use]
    pub fn input(name: impl Into<String>, caps: impl Into<CapabilitySet>) -> Self {
        Self {
            name: name.into(),
            direction: PadDirection::Input,
            presence: PadPresence::Always,
            caps: caps.into(),
        }
    }

    /// An always-present output port.
    #[must_use]
    pub fn output(name: impl Into<String>, caps: impl Into<CapabilitySet>) -> Self {
        Self {
            name: name.into(),
            direction: PadDirection::Output,
            presence: PadPresence::Always,
            caps: caps.into(),
        }
    }

    /// An output port family announced at runtime.
    #[must_use]
    pub fn sometimes_output(name: impl Into<String>, caps: impl Into<CapabilitySet>) -> Self {
        Self {
            presence: PadPresence::Sometimes,
            ..Self::output(name, caps)
        }
    }

    /// Returns true if the port is created with the stage.
    #[must_use]
    pub fn is_always(&self) -> bool {
        self.presence == PadPresence::Always
    }

    /// Returns true if `name` is an instance of this template.
    #[must_use]
    pub fn matches_name(&self, name: &str) -> bool {
        match self.name.split_once("%u") {
            Some((prefix, suffix)) => name
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_suffix(suffix))
                .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit())),
            None => self.name == name,
        }
    }

    /// Returns true if this template allows announcing `caps` as `name`.
    #[must_use]
    pub fn allows(&self, name: &str, caps: &Capability) -> bool {
        self.matches_name(name) && self.caps.accepts(caps)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::{RAW_AUDIO, RAW_VIDEO};

    #[test]
    fn test_numbered_template_matches_instances() {
        let template = PortTemplate::sometimes_output("src_%u", CapabilitySet::any());
        assert!(template.matches_name("src_0"));
        assert!(template.matches_name("src_12"));
        assert!(!template.matches_name("src_"));
        assert!(!template.matches_name("sink"));
        assert!(!template.is_always());
    }

    #[test]
    fn test_allows_checks_caps() {
        let template = PortTemplate::sometimes_output(
            "src_%u",
            CapabilitySet::OneOf(vec![Capability::new(RAW_VIDEO)]),
        );
        assert!(template.allows("src_0", &Capability::new(RAW_VIDEO).with_int("width", 640)));
        assert!(!template.allows("src_0", &Capability::new(RAW_AUDIO)));
    }
}
