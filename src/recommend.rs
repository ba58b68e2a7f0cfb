//! Business action recommendations per customer segment

use crate::data::ClusterLabel;
use std::fmt;

/// Returned for any label outside the known segment set
pub const FALLBACK_RECOMMENDATION: &str =
    "No recommendation for this segment yet; analyse further.";

/// Known customer segments, indexed by cluster label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Segment {
    LostLowValue,
    AtRisk,
    NewPotential,
    Champions,
}

impl Segment {
    pub const ALL: [Segment; 4] = [
        Segment::LostLowValue,
        Segment::AtRisk,
        Segment::NewPotential,
        Segment::Champions,
    ];

    pub fn from_label(label: ClusterLabel) -> Option<Self> {
        match label.0 {
            0 => Some(Segment::LostLowValue),
            1 => Some(Segment::AtRisk),
            2 => Some(Segment::NewPotential),
            3 => Some(Segment::Champions),
            _ => None,
        }
    }

    pub fn label(self) -> ClusterLabel {
        match self {
            Segment::LostLowValue => ClusterLabel(0),
            Segment::AtRisk => ClusterLabel(1),
            Segment::NewPotential => ClusterLabel(2),
            Segment::Champions => ClusterLabel(3),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Segment::LostLowValue => "Lost / Low Value",
            Segment::AtRisk => "At Risk / Hibernating",
            Segment::NewPotential => "New Potential",
            Segment::Champions => "Champions / VIP",
        }
    }

    pub fn recommendation(self) -> &'static str {
        match self {
            Segment::LostLowValue => {
                "Stop budget: these customers left long ago and spent little. \
                 Do not spend ad budget here; an automated email or a satisfaction survey is enough."
            }
            Segment::AtRisk => {
                "Win back: long-standing customers who are drifting away. \
                 Send a 'we miss you' campaign with a short time-limited discount (e.g. valid 24 hours)."
            }
            Segment::NewPotential => {
                "Onboarding: recent customers who do not buy often yet. \
                 Focus on product education, cross-sell complementary items and reward the second purchase."
            }
            Segment::Champions => {
                "Retention: top customers. Offer priority service, VIP access and reward points; \
                 avoid cheap discount spam and show exclusive appreciation so they stay."
            }
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Recommendation text for a cluster label, never failing
pub fn recommend(label: ClusterLabel) -> &'static str {
    Segment::from_label(label).map_or(FALLBACK_RECOMMENDATION, Segment::recommendation)
}
