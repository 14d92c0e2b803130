use serde::{Deserialize, Serialize};

use crate::event::TrackingEvent;

/// Canonical steps of the acquisition funnel, in funnel order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunnelStage {
    LandingView,
    Registered,
    ProfileComplete,
    FinancingProfileComplete,
    ApplicationStarted,
    LeadComplete,
}

impl FunnelStage {
    pub const COUNT: usize = 6;

    pub const ALL: [FunnelStage; FunnelStage::COUNT] = [
        FunnelStage::LandingView,
        FunnelStage::Registered,
        FunnelStage::ProfileComplete,
        FunnelStage::FinancingProfileComplete,
        FunnelStage::ApplicationStarted,
        FunnelStage::LeadComplete,
    ];

    /// Zero-based position in [`FunnelStage::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            FunnelStage::LandingView => "Landing page view",
            FunnelStage::Registered => "Registration complete",
            FunnelStage::ProfileComplete => "Profile complete",
            FunnelStage::FinancingProfileComplete => "Financing profile complete",
            FunnelStage::ApplicationStarted => "Application started",
            FunnelStage::LeadComplete => "Lead complete",
        }
    }
}

/// Event-type → stage table. Several producer spellings map to one stage so
/// renamed instrumentation keeps counting; each stage keeps one meaning.
const STAGE_TABLE: &[(&str, FunnelStage)] = &[
    ("page-view", FunnelStage::LandingView),
    ("pageview", FunnelStage::LandingView),
    ("registration-complete", FunnelStage::Registered),
    ("conversionlandingpage", FunnelStage::Registered),
    ("profile-complete", FunnelStage::ProfileComplete),
    ("personalinformationcomplete", FunnelStage::ProfileComplete),
    (
        "financing-profile-complete",
        FunnelStage::FinancingProfileComplete,
    ),
    (
        "perfilacionbancariacomplete",
        FunnelStage::FinancingProfileComplete,
    ),
    ("application-started", FunnelStage::ApplicationStarted),
    ("comienzasolicitud", FunnelStage::ApplicationStarted),
    ("lead-complete", FunnelStage::LeadComplete),
    ("leadcomplete", FunnelStage::LeadComplete),
    ("application-submitted", FunnelStage::LeadComplete),
    ("applicationsubmission", FunnelStage::LeadComplete),
];

/// Lowercase and fold `_` / spaces into `-` so `Page_View`, `page view` and
/// `page-view` are the same type.
pub fn normalize_event_type(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| match c {
            '_' | ' ' => '-',
            other => other.to_ascii_lowercase(),
        })
        .collect()
}

/// Maps events to funnel stages using the fixed [`STAGE_TABLE`].
///
/// The optional landing path narrows which page views count as
/// [`FunnelStage::LandingView`]; it never changes whether an event is a page
/// view for page-level reporting.
#[derive(Debug, Clone, Default)]
pub struct StageClassifier {
    landing_path: Option<String>,
}

impl StageClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_landing_path(landing_path: Option<String>) -> Self {
        Self {
            landing_path: landing_path
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty()),
        }
    }

    pub fn landing_path(&self) -> Option<&str> {
        self.landing_path.as_deref()
    }

    pub fn stage_for_type(event_type: &str) -> Option<FunnelStage> {
        let normalized = normalize_event_type(event_type);
        STAGE_TABLE
            .iter()
            .find(|(name, _)| *name == normalized)
            .map(|(_, stage)| *stage)
    }

    pub fn is_page_view(&self, event: &TrackingEvent) -> bool {
        Self::stage_for_type(&event.event_type) == Some(FunnelStage::LandingView)
    }

    /// The stage `event` qualifies for, if any.
    pub fn classify(&self, event: &TrackingEvent) -> Option<FunnelStage> {
        let stage = Self::stage_for_type(&event.event_type)?;
        if stage != FunnelStage::LandingView {
            return Some(stage);
        }
        match &self.landing_path {
            None => Some(stage),
            Some(landing) => event
                .attributes
                .page_path()
                .filter(|path| path.contains(landing.as_str()))
                .map(|_| stage),
        }
    }
}
