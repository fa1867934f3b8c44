use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(UserId);
typed_id!(ProfileId);
typed_id!(RecordId);
typed_id!(PlantId);
typed_id!(LogId);

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("latitude must be between -90 and 90, got {0}")]
    Latitude(f64),
    #[error("longitude must be between -180 and 180, got {0}")]
    Longitude(f64),
    #[error("record {id} is a {scan_type} scan but carries a {schema} diagnosis")]
    PayloadMismatch {
        id: RecordId,
        scan_type: ScanType,
        schema: &'static str,
    },
    #[error("{0} cannot be empty")]
    Empty(&'static str),
    #[error("{0} must be a finite number")]
    NotFinite(&'static str),
}

fn ensure_finite(value: f64, what: &'static str) -> Result<(), ValidationError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ValidationError::NotFinite(what))
    }
}

// --- Location ---

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawLocation")]
pub struct Location {
    lat: f64,
    lon: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Deserialize)]
struct RawLocation {
    lat: f64,
    lon: f64,
    #[serde(default)]
    label: Option<String>,
}

impl TryFrom<RawLocation> for Location {
    type Error = ValidationError;

    fn try_from(raw: RawLocation) -> Result<Self, Self::Error> {
        let location = Self::new(raw.lat, raw.lon)?;
        Ok(Self {
            label: raw.label,
            ..location
        })
    }
}

impl Location {
    pub fn new(lat: f64, lon: f64) -> Result<Self, ValidationError> {
        if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
            return Err(ValidationError::Latitude(lat));
        }
        if !lon.is_finite() || !(-180.0..=180.0).contains(&lon) {
            return Err(ValidationError::Longitude(lon));
        }
        Ok(Self {
            lat,
            lon,
            label: None,
        })
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn lat(&self) -> f64 {
        self.lat
    }

    pub fn lon(&self) -> f64 {
        self.lon
    }
}

// --- Scan payloads ---

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanType {
    Leaf,
    Crop,
}

impl fmt::Display for ScanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScanType::Leaf => "leaf",
            ScanType::Crop => "crop",
        })
    }
}

/// Leaf disease diagnosis, schema `leaf-v1`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeafDiagnosis {
    pub condition: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default)]
    pub treatments: Vec<String>,
    /// Anything else the diagnosis service returned.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

/// Produce grading result, schema `crop-v1`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CropGrading {
    pub grade: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defects: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_shelf_life_days: Option<u32>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "schema", rename_all = "kebab-case")]
pub enum Diagnosis {
    #[serde(rename = "leaf-v1")]
    LeafV1(LeafDiagnosis),
    #[serde(rename = "crop-v1")]
    CropV1(CropGrading),
    /// Untyped payload written before diagnoses carried a schema tag.
    Legacy { payload: Value },
}

impl Diagnosis {
    pub fn schema(&self) -> &'static str {
        match self {
            Diagnosis::LeafV1(_) => "leaf-v1",
            Diagnosis::CropV1(_) => "crop-v1",
            Diagnosis::Legacy { .. } => "legacy",
        }
    }

    pub fn accepts(&self, scan_type: ScanType) -> bool {
        matches!(
            (self, scan_type),
            (Diagnosis::LeafV1(_), ScanType::Leaf)
                | (Diagnosis::CropV1(_), ScanType::Crop)
                | (Diagnosis::Legacy { .. }, _)
        )
    }

    /// One-line summary used for growth timeline entries.
    pub fn summary(&self) -> String {
        match self {
            Diagnosis::LeafV1(d) => d.condition.clone(),
            Diagnosis::CropV1(g) => format!("grade {}", g.grade),
            Diagnosis::Legacy { payload } => payload
                .get("condition")
                .or_else(|| payload.get("summary"))
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
        }
    }
}

// --- History ---

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: RecordId,
    pub plant_id: PlantId,
    pub timestamp: UnixTimeMs,
    /// Data URI; never interpreted here.
    pub image: String,
    pub diagnosis: Diagnosis,
    #[serde(default)]
    pub action_result: Option<Value>,
    pub scan_type: ScanType,
    #[serde(default)]
    pub notes: String,
}

impl HistoryRecord {
    pub fn new(
        plant_id: PlantId,
        scan_type: ScanType,
        image: impl Into<String>,
        diagnosis: Diagnosis,
    ) -> Self {
        Self {
            id: RecordId::generate(),
            plant_id,
            timestamp: UnixTimeMs::now(),
            image: image.into(),
            diagnosis,
            action_result: None,
            scan_type,
            notes: String::new(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.as_str().trim().is_empty() {
            return Err(ValidationError::Empty("record id"));
        }
        match &self.diagnosis {
            Diagnosis::LeafV1(d) => ensure_finite(d.confidence, "diagnosis confidence")?,
            Diagnosis::CropV1(g) => ensure_finite(g.confidence, "grading confidence")?,
            Diagnosis::Legacy { .. } => {}
        }
        if !self.diagnosis.accepts(self.scan_type) {
            return Err(ValidationError::PayloadMismatch {
                id: self.id.clone(),
                scan_type: self.scan_type,
                schema: self.diagnosis.schema(),
            });
        }
        Ok(())
    }
}

// --- Profiles ---

pub type HealthMetrics = BTreeMap<String, f64>;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrowthEntry {
    pub date: String,
    pub stage: String,
    #[serde(default)]
    pub health_metrics: HealthMetrics,
    #[serde(default)]
    pub diagnosis: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
}

impl GrowthEntry {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.health_metrics
            .values()
            .try_for_each(|v| ensure_finite(*v, "health metric"))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: ProfileId,
    pub name: String,
    #[serde(default)]
    pub crop_type: String,
    #[serde(default)]
    pub variety: String,
    #[serde(default)]
    pub start_date: String,
    #[serde(default)]
    pub current_stage: String,
    #[serde(default)]
    pub growth_history: Vec<GrowthEntry>,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub preferences: BTreeMap<String, Value>,
}

impl Profile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ProfileId::generate(),
            name: name.into(),
            crop_type: String::new(),
            variety: String::new(),
            start_date: String::new(),
            current_stage: String::new(),
            growth_history: Vec::new(),
            location: None,
            preferences: BTreeMap::new(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.as_str().trim().is_empty() {
            return Err(ValidationError::Empty("profile id"));
        }
        if self.name.trim().is_empty() {
            return Err(ValidationError::Empty("profile name"));
        }
        self.growth_history.iter().try_for_each(GrowthEntry::validate)
    }
}

// --- Planning horizons ---

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChecklistItem {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub done: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShortHorizon {
    pub date: Option<String>,
    pub checklist: Vec<ChecklistItem>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendSample {
    pub date: String,
    pub score: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MediumHorizon {
    pub trend: Vec<TrendSample>,
    pub insight: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LongHorizon {
    pub season_target: Option<String>,
    pub current_phase: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Horizons {
    pub short: ShortHorizon,
    pub medium: MediumHorizon,
    pub long: LongHorizon,
}

impl Horizons {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.medium
            .trend
            .iter()
            .try_for_each(|s| ensure_finite(s.score, "trend score"))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Preferences {
    pub notifications_enabled: bool,
    pub auto_sync: bool,
    pub metric_units: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            notifications_enabled: true,
            auto_sync: true,
            metric_units: true,
        }
    }
}

// --- Logs ---

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: LogId,
    pub timestamp: UnixTimeMs,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            id: LogId::generate(),
            timestamp: UnixTimeMs::now(),
            level,
            message: message.into(),
            context: None,
        }
    }
}

/// Monitoring-plan sessions are owned by the planner; stored as-is.
pub type MonitoringSession = Value;

// --- Root ---

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemState {
    pub user_id: UserId,
    #[serde(default)]
    pub active_profile_id: Option<ProfileId>,
    #[serde(default)]
    pub profiles: Vec<Profile>,
    /// Newest first.
    #[serde(default)]
    pub history: Vec<HistoryRecord>,
    #[serde(default)]
    pub horizons: Horizons,
    #[serde(default)]
    pub preferences: Preferences,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub visual_cache: BTreeMap<String, String>,
    #[serde(default)]
    pub sessions: BTreeMap<String, MonitoringSession>,
}

impl SystemState {
    /// Fresh state with a single default profile that is also active.
    pub fn new(user_id: UserId, default_profile_name: &str) -> Self {
        let profile = Profile::new(default_profile_name);
        Self {
            user_id,
            active_profile_id: Some(profile.id.clone()),
            profiles: vec![profile],
            history: Vec::new(),
            horizons: Horizons::default(),
            preferences: Preferences::default(),
            logs: Vec::new(),
            visual_cache: BTreeMap::new(),
            sessions: BTreeMap::new(),
        }
    }

    pub fn profile(&self, id: &ProfileId) -> Option<&Profile> {
        self.profiles.iter().find(|p| &p.id == id)
    }

    pub fn active_profile(&self) -> Option<&Profile> {
        self.active_profile_id
            .as_ref()
            .and_then(|id| self.profile(id))
    }

    pub fn history_record(&self, id: &RecordId) -> Option<&HistoryRecord> {
        self.history.iter().find(|r| &r.id == id)
    }
}
