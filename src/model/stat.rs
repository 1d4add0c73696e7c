use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a statistic has a displayed value or is a chart only.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StatKind {
    /// A summary metric such as WN8 or win rate, with a text value.
    TextMetric,
    /// A per-vehicle chart; image only.
    VehicleChart,
}

/// One statistic scraped from a player's stats page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticEntry {
    pub kind: StatKind,
    pub name: String,
    pub value: Option<String>,
    /// DOM anchor in `#id` form, unique within one scrape.
    pub anchor_id: String,
    /// PNG bytes of the trend chart, when captured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<Vec<u8>>,
}

impl StatisticEntry {
    pub fn metric(
        name: impl Into<String>,
        value: impl Into<String>,
        anchor_id: impl Into<String>,
    ) -> Self {
        Self {
            kind: StatKind::TextMetric,
            name: name.into(),
            value: Some(value.into()),
            anchor_id: anchor_id.into(),
            image: None,
        }
    }

    pub fn vehicle_chart(name: impl Into<String>, anchor_id: impl Into<String>) -> Self {
        Self {
            kind: StatKind::VehicleChart,
            name: name.into(),
            value: None,
            anchor_id: anchor_id.into(),
            image: None,
        }
    }

    pub fn with_image(mut self, image: Vec<u8>) -> Self {
        self.image = Some(image);
        self
    }
}

/// A statistic row as persisted for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredStatistic {
    pub id: i64,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub entry: StatisticEntry,
}
