//! Vendor-string pattern matches the session relies on.
//!
//! These are guesses against backend-supplied text. They live behind one
//! trait so a backend with different wording can get its own rules without
//! touching the session state machine.

use libsane::{OptionCapabilities, OptionDescriptor};

pub trait Heuristics: Send + Sync {
    /// The option reflects hardware state that changes on its own, e.g. a
    /// front panel button.
    fn needs_polling(&self, descriptor: &OptionDescriptor) -> bool;

    /// Colours must be inverted for this source and film type.
    fn wants_inversion(&self, source: &str, film_type: &str) -> bool;

    /// The source feeds pages automatically. The default rule matches
    /// "Automatic Document Feeder" or "ADF" with exact case, unlike the
    /// case-insensitive inversion rule.
    fn is_document_feeder(&self, source: &str) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHeuristics;

impl Heuristics for DefaultHeuristics {
    fn needs_polling(&self, descriptor: &OptionDescriptor) -> bool {
        let caps = descriptor.capabilities;
        caps.contains(OptionCapabilities::SoftDetect)
            && !caps.contains(OptionCapabilities::SoftSelect)
    }

    fn wants_inversion(&self, source: &str, film_type: &str) -> bool {
        source.to_lowercase().contains("transparency")
            && film_type.to_lowercase().contains("negative")
    }

    fn is_document_feeder(&self, source: &str) -> bool {
        source.contains("Automatic Document Feeder") || source.contains("ADF")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libsane::{OptionConstraint, OptionType, OptionUnit};

    fn descriptor(capabilities: OptionCapabilities) -> OptionDescriptor {
        OptionDescriptor {
            name: Some("scan".into()),
            title: "Scan button".into(),
            description: "".into(),
            ty: OptionType::Bool,
            unit: OptionUnit::None,
            size: 4,
            capabilities,
            constraint: OptionConstraint::None,
        }
    }

    #[test]
    fn polls_read_only_detectable_options() {
        let rules = DefaultHeuristics;

        assert!(rules.needs_polling(&descriptor(
            OptionCapabilities::SoftDetect | OptionCapabilities::HardSelect
        )));
        assert!(!rules.needs_polling(&descriptor(
            OptionCapabilities::SoftDetect | OptionCapabilities::SoftSelect
        )));
        assert!(!rules.needs_polling(&descriptor(OptionCapabilities::HardSelect)));
    }

    #[test]
    fn inverts_negative_film_on_transparency_unit() {
        let rules = DefaultHeuristics;

        assert!(rules.wants_inversion("Transparency Adapter", "Negative Film"));
        assert!(rules.wants_inversion("TRANSPARENCY", "negative"));
        assert!(!rules.wants_inversion("Transparency Adapter", "Positive Film"));
        assert!(!rules.wants_inversion("Flatbed", "Negative Film"));
    }

    #[test]
    fn recognises_document_feeders() {
        let rules = DefaultHeuristics;

        assert!(rules.is_document_feeder("Automatic Document Feeder"));
        assert!(rules.is_document_feeder("ADF Duplex"));
        assert!(!rules.is_document_feeder("Flatbed"));
        assert!(!rules.is_document_feeder("adf"));
    }
}
