use std::borrow::Cow;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// One behavioural event as stored in the external tracking log.
///
/// Events are immutable once produced. Nothing in the engine assumes they
/// arrive ordered by `occurred_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingEvent {
    pub id: String,
    pub event_type: String,
    /// Stable identifier of the person behind the event. `None` (or an empty
    /// string, which producers also emit) marks anonymous traffic.
    pub actor_id: Option<String>,
    pub session_id: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub attributes: EventAttributes,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_campaign: Option<String>,
}

impl TrackingEvent {
    /// The actor identifier, or `None` for anonymous events.
    pub fn actor(&self) -> Option<&str> {
        non_blank(self.actor_id.as_deref())
    }

    /// The session identifier, or `None` when the producer left it blank.
    pub fn session(&self) -> Option<&str> {
        non_blank(Some(self.session_id.as_str()))
    }

    pub fn source(&self) -> Option<&str> {
        non_blank(self.utm_source.as_deref())
    }

    pub fn medium(&self) -> Option<&str> {
        non_blank(self.utm_medium.as_deref())
    }

    pub fn campaign(&self) -> Option<&str> {
        non_blank(self.utm_campaign.as_deref())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Open key/value bag attached to every event.
///
/// Only a handful of keys are interpreted by the engine and they are reached
/// through the named accessors below. Everything else is carried untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventAttributes(BTreeMap<String, String>);

impl EventAttributes {
    pub const PAGE_PATH: &'static str = "page_path";
    pub const PAGE: &'static str = "page";
    pub const PAGE_URL: &'static str = "page_url";
    pub const REFERRER: &'static str = "referrer";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Path of the page the event was recorded on.
    ///
    /// Producers disagree on the key: `page_path` wins, then `page`, then the
    /// path component of `page_url`.
    pub fn page_path(&self) -> Option<Cow<'_, str>> {
        if let Some(path) = non_blank(self.get(Self::PAGE_PATH)) {
            return Some(Cow::Borrowed(path));
        }
        if let Some(path) = non_blank(self.get(Self::PAGE)) {
            return Some(Cow::Borrowed(path));
        }
        non_blank(self.get(Self::PAGE_URL)).and_then(url_path)
    }

    pub fn referrer(&self) -> Option<&str> {
        non_blank(self.get(Self::REFERRER))
    }

    /// Lowercased host of the referrer URL.
    pub fn referrer_host(&self) -> Option<String> {
        self.referrer().and_then(extract_host)
    }

    /// A click identifier such as `fbclid`, when present and non-blank.
    pub fn click_id(&self, key: &str) -> Option<&str> {
        non_blank(self.get(key))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EventAttributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Parse an absolute or scheme-less URL. Relative paths are not URLs here.
fn parse_url(raw: &str) -> Option<Url> {
    let raw = raw.trim();
    if raw.is_empty() || (raw.starts_with('/') && !raw.starts_with("//")) {
        return None;
    }
    match Url::parse(raw) {
        Ok(url) => Some(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let with_scheme = if raw.starts_with("//") {
                format!("https:{raw}")
            } else {
                format!("https://{raw}")
            };
            Url::parse(&with_scheme).ok()
        }
        Err(_) => None,
    }
}

/// Extract the lowercased host from a URL-ish string.
///
/// Tolerates missing schemes, userinfo and ports. Returns `None` for
/// relative paths.
pub fn extract_host(raw: &str) -> Option<String> {
    let url = parse_url(raw)?;
    url.host_str()
        .filter(|host| !host.is_empty())
        .map(str::to_ascii_lowercase)
}

fn url_path(raw: &str) -> Option<Cow<'_, str>> {
    let raw = raw.trim();
    if raw.starts_with('/') && !raw.starts_with("//") {
        return raw
            .split(['?', '#'])
            .next()
            .filter(|path| !path.is_empty())
            .map(Cow::Borrowed);
    }
    let url = parse_url(raw)?;
    if url.cannot_be_a_base() {
        return None;
    }
    Some(Cow::Owned(url.path().to_string()))
}
