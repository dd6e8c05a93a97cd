//! Feature extraction: a raw [`Lead`] turned into normalized signals.
//!
//! This is the only place that looks at optional lead fields. Everything
//! downstream works on [`LeadFeatures`], where every value has already been
//! resolved to a concrete default.

use std::sync::LazyLock;

use regex::Regex;

use crate::lead::Lead;

static EMAIL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("valid email regex")
});

const MAJOR_LOCATIONS: &[&str] = &[
    "new york",
    "los angeles",
    "chicago",
    "miami",
    "san francisco",
    "las vegas",
];

/// Locations that raise the estimated value of a lead.
const PREMIUM_LOCATIONS: &[&str] = &["new york", "los angeles", "miami"];

const MIN_PHONE_DIGITS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailSignal {
    Absent,
    /// Present but not syntactically valid.
    Invalid,
    Valid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhoneSignal {
    Absent,
    /// Present but too short to dial.
    Present,
    Valid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoTier {
    Unknown,
    Regional,
    Major,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocialPresence {
    pub instagram: bool,
    pub onlyfans: bool,
    pub twitter: bool,
    pub linkedin: bool,
}

impl SocialPresence {
    pub fn count(&self) -> usize {
        [self.instagram, self.onlyfans, self.twitter, self.linkedin]
            .iter()
            .filter(|present| **present)
            .count()
    }

    /// Presence on a platform where the lead already monetizes an audience.
    pub fn monetized(&self) -> bool {
        self.onlyfans
    }
}

/// Normalized signals for one lead.
#[derive(Debug, Clone, PartialEq)]
pub struct LeadFeatures {
    pub email: EmailSignal,
    pub phone: PhoneSignal,
    pub social: SocialPresence,
    /// Lower-cased description; empty when the lead has none.
    pub description: String,
    /// Length in characters of the original description.
    pub description_len: usize,
    pub geo: GeoTier,
    pub premium_location: bool,
}

/// Stateless extractor. Total: never fails, missing data maps to defaults.
pub struct FeatureExtractor;

impl FeatureExtractor {
    pub fn extract(lead: &Lead) -> LeadFeatures {
        let email = match Lead::field(&lead.email) {
            None => EmailSignal::Absent,
            Some(e) if EMAIL_PATTERN.is_match(e) => EmailSignal::Valid,
            Some(_) => EmailSignal::Invalid,
        };

        let phone = match Lead::field(&lead.phone) {
            None => PhoneSignal::Absent,
            Some(p) => {
                let digits = p
                    .chars()
                    .filter(|c| c.is_ascii_digit() || *c == '+')
                    .count();
                if digits >= MIN_PHONE_DIGITS {
                    PhoneSignal::Valid
                } else {
                    PhoneSignal::Present
                }
            }
        };

        let social = SocialPresence {
            instagram: Lead::field(&lead.social.instagram_url).is_some(),
            onlyfans: Lead::field(&lead.social.onlyfans_url).is_some(),
            twitter: Lead::field(&lead.social.twitter_url).is_some(),
            linkedin: Lead::field(&lead.social.linkedin_url).is_some(),
        };

        let raw_description = Lead::field(&lead.description).unwrap_or("");
        let location = Lead::field(&lead.location)
            .map(str::to_lowercase)
            .unwrap_or_default();

        let geo = if location.is_empty() {
            GeoTier::Unknown
        } else if MAJOR_LOCATIONS.iter().any(|city| location.contains(city)) {
            GeoTier::Major
        } else {
            GeoTier::Regional
        };

        LeadFeatures {
            email,
            phone,
            social,
            description: raw_description.to_lowercase(),
            description_len: raw_description.chars().count(),
            geo,
            premium_location: PREMIUM_LOCATIONS.iter().any(|city| location.contains(city)),
        }
    }
}
