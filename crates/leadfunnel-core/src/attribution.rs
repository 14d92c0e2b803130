//! Heuristic paid-channel attribution.
//!
//! A match is evidence, not a join against the ad platform: stripped referrer
//! headers produce false negatives. Membership is non-exclusive, so one event
//! may count toward several channels.

use serde::Serialize;

use crate::event::{extract_host, TrackingEvent};

/// Matching rules for one named paid channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelRule {
    pub name: String,
    /// Attribute keys carrying the platform's click identifier.
    pub click_id_keys: Vec<String>,
    /// Referrer hosts; subdomains match too.
    pub referrer_domains: Vec<String>,
    /// Lowercase substrings looked for in `utm_source` / `utm_medium`.
    pub utm_keywords: Vec<String>,
}

fn owned(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

impl ChannelRule {
    pub const META: &'static str = "meta";
    pub const GOOGLE_ADS: &'static str = "google_ads";

    pub fn new(
        name: impl Into<String>,
        click_id_keys: &[&str],
        referrer_domains: &[&str],
        utm_keywords: &[&str],
    ) -> Self {
        Self {
            name: name.into(),
            click_id_keys: owned(click_id_keys),
            referrer_domains: referrer_domains
                .iter()
                .map(|d| d.to_ascii_lowercase())
                .collect(),
            utm_keywords: utm_keywords
                .iter()
                .map(|k| k.to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn meta() -> Self {
        Self::new(
            Self::META,
            &["fbclid"],
            &["facebook.com", "instagram.com", "fb.com"],
            &["facebook", "instagram", "meta"],
        )
    }

    pub fn google_ads() -> Self {
        Self::new(
            Self::GOOGLE_ADS,
            &["gclid", "gbraid", "wbraid"],
            &["googleadservices.com", "doubleclick.net"],
            &["google", "adwords"],
        )
    }

    /// Look up a built-in rule by name.
    pub fn builtin(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            Self::META => Some(Self::meta()),
            Self::GOOGLE_ADS => Some(Self::google_ads()),
            _ => None,
        }
    }

    /// Parse a comma-separated list of built-in channel names.
    pub fn parse_list(raw: &str) -> Result<Vec<Self>, String> {
        let mut rules: Vec<Self> = Vec::new();
        for name in raw.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let rule = Self::builtin(name).ok_or_else(|| format!("unknown channel: {name}"))?;
            if !rules.iter().any(|r| r.name == rule.name) {
                rules.push(rule);
            }
        }
        Ok(rules)
    }

    fn host_matches(&self, host: &str) -> bool {
        self.referrer_domains.iter().any(|domain| {
            host == domain
                || host
                    .strip_suffix(domain.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    fn tag_matches(&self, tag: Option<&str>) -> bool {
        match tag {
            Some(tag) => {
                let tag = tag.to_ascii_lowercase();
                self.utm_keywords.iter().any(|k| tag.contains(k.as_str()))
            }
            None => false,
        }
    }
}

/// Whether `event` carries evidence of arriving through `rule`'s channel.
pub fn is_paid_channel(event: &TrackingEvent, rule: &ChannelRule) -> bool {
    if rule
        .click_id_keys
        .iter()
        .any(|key| event.attributes.click_id(key).is_some())
    {
        return true;
    }
    if let Some(host) = event.attributes.referrer().and_then(extract_host) {
        if rule.host_matches(&host) {
            return true;
        }
    }
    rule.tag_matches(event.source()) || rule.tag_matches(event.medium())
}
