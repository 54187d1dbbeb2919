use serde::{Deserialize, Serialize};

use crate::time_window::{normalize_window, CommuteSegment};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Weekday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl Weekday {
    pub fn as_str(self) -> &'static str {
        match self {
            Weekday::Monday => "MONDAY",
            Weekday::Tuesday => "TUESDAY",
            Weekday::Wednesday => "WEDNESDAY",
            Weekday::Thursday => "THURSDAY",
            Weekday::Friday => "FRIDAY",
            Weekday::Saturday => "SATURDAY",
            Weekday::Sunday => "SUNDAY",
        }
    }
}

/// Preferred commute window in 24-hour "HH:mm" notation. A window whose end
/// precedes its start is interpreted as crossing midnight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommuteWindow {
    pub start: String,
    pub end: String,
}

/// One user's matching preferences plus the cached embedding derived from
/// them. `embedding` is only meaningful while `embedding_text` still reflects
/// the current preference fields; any preference update clears it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub profession: String,
    #[serde(default)]
    pub about_me: String,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub interests: Vec<String>,
    #[serde(default)]
    pub commute_window: Option<CommuteWindow>,
    #[serde(default)]
    pub commute_days: Vec<Weekday>,
    #[serde(default)]
    pub embedding_text: String,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub embedding_version: String,
}

impl Profile {
    pub fn has_embedding(&self) -> bool {
        self.embedding.as_ref().is_some_and(|v| !v.is_empty())
    }

    /// Minute-of-day segments for this profile's commute window. Recomputed
    /// on demand so the segments can never drift from their source window.
    pub fn commute_segments(&self) -> Vec<CommuteSegment> {
        normalize_window(self.commute_window.as_ref())
    }

    pub fn day_names(&self) -> Vec<&'static str> {
        self.commute_days.iter().map(|d| d.as_str()).collect()
    }
}
