//! Normalizes a freshly loaded document before it is deserialized.
//!
//! Works on the raw JSON with structural presence checks instead of a version
//! number: every step looks for a specific old shape and rewrites it, and is a
//! no-op on a document that is already current. Running the engine twice is
//! therefore the same as running it once.

use std::collections::HashSet;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::model::{Diagnosis, HistoryRecord, Location, Profile, ProfileId, RecordId, UserId};
use crate::ErrorKind;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MigrationError {
    #[error("stored document is not a JSON object (found {0})")]
    NotAnObject(&'static str),
}

impl MigrationError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::StorageUnavailable
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub applied: Vec<&'static str>,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

type Step = fn(&MigrationEngine, &mut Map<String, Value>, &UserId) -> bool;

#[derive(Debug, Clone)]
pub struct MigrationEngine {
    default_profile_name: String,
    growth_history_cap: usize,
}

impl MigrationEngine {
    const STEPS: &'static [(&'static str, Step)] = &[
        ("wrap-legacy-profile", Self::wrap_legacy_profile),
        ("ensure-history", Self::ensure_history),
        ("ensure-profiles", Self::ensure_profiles),
        ("assign-profile-ids", Self::assign_profile_ids),
        ("dedupe-profiles", Self::dedupe_profiles),
        ("repair-profile-locations", Self::repair_profile_locations),
        ("drop-unreadable-profiles", Self::drop_unreadable_profiles),
        ("repair-active-profile", Self::repair_active_profile),
        ("fill-user-id", Self::fill_user_id),
        ("normalize-history-records", Self::normalize_history_records),
        ("drop-unreadable-history", Self::drop_unreadable_history),
        ("dedupe-history", Self::dedupe_history),
        ("cap-growth-history", Self::cap_growth_history),
    ];

    pub fn new(config: &StoreConfig) -> Self {
        Self {
            default_profile_name: config.default_profile_name.clone(),
            growth_history_cap: config.growth_history_cap,
        }
    }

    pub fn migrate(
        &self,
        doc: &mut Value,
        user_id: &UserId,
    ) -> Result<MigrationReport, MigrationError> {
        let map = match doc {
            Value::Object(map) => map,
            other => return Err(MigrationError::NotAnObject(json_type(other))),
        };

        let mut report = MigrationReport::default();
        for &(name, step) in Self::STEPS {
            if step(self, map, user_id) {
                debug!(step = name, "migration step applied");
                report.applied.push(name);
            }
        }

        if !report.is_noop() {
            info!(user_id = %user_id, steps = ?report.applied, "migrated stored state");
        }
        Ok(report)
    }

    fn default_profile(&self) -> Value {
        json!({
            "id": ProfileId::generate(),
            "name": self.default_profile_name,
        })
    }

    /// `{profile: {...}}` from before multi-profile support.
    fn wrap_legacy_profile(&self, doc: &mut Map<String, Value>, _: &UserId) -> bool {
        let profiles_empty = match doc.get("profiles") {
            None | Some(Value::Null) => true,
            Some(Value::Array(profiles)) => profiles.is_empty(),
            Some(_) => false,
        };
        if !profiles_empty {
            return false;
        }
        let Some(legacy) = doc.remove("profile") else {
            return false;
        };
        let Value::Object(mut profile) = legacy else {
            // nothing worth keeping; ensure-profiles supplies a default
            return true;
        };

        let id = match profile.get("id").and_then(Value::as_str) {
            Some(id) if !id.trim().is_empty() => id.to_string(),
            _ => {
                let id = ProfileId::generate().0;
                profile.insert("id".into(), Value::String(id.clone()));
                id
            }
        };
        if !has_nonempty_str(&profile, "name") {
            profile.insert(
                "name".into(),
                Value::String(self.default_profile_name.clone()),
            );
        }

        doc.insert("profiles".into(), Value::Array(vec![Value::Object(profile)]));
        doc.insert("activeProfileId".into(), Value::String(id));
        true
    }

    fn ensure_history(&self, doc: &mut Map<String, Value>, _: &UserId) -> bool {
        if matches!(doc.get("history"), Some(Value::Array(_))) {
            return false;
        }
        doc.insert("history".into(), Value::Array(Vec::new()));
        true
    }

    fn ensure_profiles(&self, doc: &mut Map<String, Value>, _: &UserId) -> bool {
        if let Some(Value::Array(profiles)) = doc.get("profiles") {
            if profiles.iter().any(Value::is_object) {
                if profiles.iter().all(Value::is_object) {
                    return false;
                }
                let kept: Vec<Value> = profiles.iter().filter(|p| p.is_object()).cloned().collect();
                doc.insert("profiles".into(), Value::Array(kept));
                return true;
            }
        }
        doc.insert("profiles".into(), Value::Array(vec![self.default_profile()]));
        true
    }

    fn assign_profile_ids(&self, doc: &mut Map<String, Value>, _: &UserId) -> bool {
        let Some(Value::Array(profiles)) = doc.get_mut("profiles") else {
            return false;
        };
        let mut changed = false;
        for profile in profiles.iter_mut().filter_map(Value::as_object_mut) {
            if !has_nonempty_str(profile, "id") {
                profile.insert("id".into(), json!(ProfileId::generate()));
                changed = true;
            }
            if !has_nonempty_str(profile, "name") {
                profile.insert("name".into(), json!(self.default_profile_name));
                changed = true;
            }
        }
        changed
    }

    /// Keeps the first profile carrying each id.
    fn dedupe_profiles(&self, doc: &mut Map<String, Value>, _: &UserId) -> bool {
        let Some(Value::Array(profiles)) = doc.get_mut("profiles") else {
            return false;
        };
        let mut seen = HashSet::new();
        let before = profiles.len();
        profiles.retain(|profile| match profile.get("id").and_then(Value::as_str) {
            Some(id) => seen.insert(id.to_string()),
            None => true,
        });
        let dropped = before - profiles.len();
        if dropped > 0 {
            warn!(dropped, "dropped profiles with duplicate ids");
        }
        dropped > 0
    }

    /// A location outside the valid coordinate range is removed; the rest of
    /// the profile is kept.
    fn repair_profile_locations(&self, doc: &mut Map<String, Value>, _: &UserId) -> bool {
        let Some(Value::Array(profiles)) = doc.get_mut("profiles") else {
            return false;
        };
        let mut changed = false;
        for profile in profiles.iter_mut().filter_map(Value::as_object_mut) {
            let invalid = profile
                .get("location")
                .is_some_and(|l| !l.is_null() && Location::deserialize(l).is_err());
            if invalid {
                profile.remove("location");
                changed = true;
            }
        }
        changed
    }

    /// Profiles that still cannot be read are dropped one by one, so a single
    /// bad entry does not cost the whole document. The last one is replaced by
    /// a default profile.
    fn drop_unreadable_profiles(&self, doc: &mut Map<String, Value>, _: &UserId) -> bool {
        let Some(Value::Array(profiles)) = doc.get_mut("profiles") else {
            return false;
        };
        let before = profiles.len();
        profiles.retain(|p| Profile::deserialize(p).is_ok());
        let dropped = before - profiles.len();
        if dropped == 0 {
            return false;
        }
        warn!(dropped, "dropped unreadable profiles");
        if profiles.is_empty() {
            profiles.push(self.default_profile());
        }
        true
    }

    fn repair_active_profile(&self, doc: &mut Map<String, Value>, _: &UserId) -> bool {
        let ids: Vec<String> = match doc.get("profiles") {
            Some(Value::Array(profiles)) => profiles
                .iter()
                .filter_map(|p| p.get("id").and_then(Value::as_str))
                .map(str::to_string)
                .collect(),
            _ => return false,
        };
        let active = doc.get("activeProfileId").and_then(Value::as_str);
        if active.is_some_and(|a| ids.iter().any(|id| id == a)) {
            return false;
        }
        let Some(first) = ids.into_iter().next() else {
            return false;
        };
        doc.insert("activeProfileId".into(), Value::String(first));
        true
    }

    fn fill_user_id(&self, doc: &mut Map<String, Value>, user_id: &UserId) -> bool {
        if has_nonempty_str(doc, "userId") {
            return false;
        }
        doc.insert("userId".into(), json!(user_id));
        true
    }

    /// Older records carry untagged AI payloads and may miss fields that are
    /// required today.
    fn normalize_history_records(&self, doc: &mut Map<String, Value>, _: &UserId) -> bool {
        let active = doc
            .get("activeProfileId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let Some(Value::Array(history)) = doc.get_mut("history") else {
            return false;
        };

        let before = history.len();
        history.retain(Value::is_object);
        let mut changed = history.len() != before;

        for record in history.iter_mut().filter_map(Value::as_object_mut) {
            if !has_nonempty_str(record, "id") {
                record.insert("id".into(), json!(RecordId::generate()));
                changed = true;
            }
            if !matches!(
                record.get("scanType").and_then(Value::as_str),
                Some("leaf" | "crop")
            ) {
                record.insert("scanType".into(), json!("leaf"));
                changed = true;
            }
            if !record.get("plantId").is_some_and(Value::is_string) {
                record.insert("plantId".into(), json!(active));
                changed = true;
            }
            if !record.get("timestamp").is_some_and(Value::is_u64) {
                record.insert("timestamp".into(), json!(0));
                changed = true;
            }
            if !record.get("image").is_some_and(Value::is_string) {
                record.insert("image".into(), json!(""));
                changed = true;
            }

            // unknown schemas and malformed payloads are kept verbatim
            let readable = record
                .get("diagnosis")
                .is_some_and(|d| Diagnosis::deserialize(d).is_ok());
            if !readable {
                let payload = record.remove("diagnosis").unwrap_or(Value::Null);
                record.insert(
                    "diagnosis".into(),
                    json!({ "schema": "legacy", "payload": payload }),
                );
                changed = true;
            }
        }
        changed
    }

    fn drop_unreadable_history(&self, doc: &mut Map<String, Value>, _: &UserId) -> bool {
        let Some(Value::Array(history)) = doc.get_mut("history") else {
            return false;
        };
        let before = history.len();
        history.retain(|r| HistoryRecord::deserialize(r).is_ok());
        let dropped = before - history.len();
        if dropped > 0 {
            warn!(dropped, "dropped unreadable history records");
        }
        dropped > 0
    }

    /// Keeps the first (newest) occurrence of each id.
    fn dedupe_history(&self, doc: &mut Map<String, Value>, _: &UserId) -> bool {
        let Some(Value::Array(history)) = doc.get_mut("history") else {
            return false;
        };
        let mut seen = HashSet::new();
        let before = history.len();
        history.retain(|record| match record.get("id").and_then(Value::as_str) {
            Some(id) => seen.insert(id.to_string()),
            None => true,
        });
        history.len() != before
    }

    fn cap_growth_history(&self, doc: &mut Map<String, Value>, _: &UserId) -> bool {
        let Some(Value::Array(profiles)) = doc.get_mut("profiles") else {
            return false;
        };
        let mut changed = false;
        for profile in profiles.iter_mut().filter_map(Value::as_object_mut) {
            if let Some(Value::Array(growth)) = profile.get_mut("growthHistory") {
                if growth.len() > self.growth_history_cap {
                    let excess = growth.len() - self.growth_history_cap;
                    growth.drain(..excess);
                    changed = true;
                }
            }
        }
        changed
    }
}

fn has_nonempty_str(map: &Map<String, Value>, field: &str) -> bool {
    map.get(field)
        .and_then(Value::as_str)
        .is_some_and(|s| !s.trim().is_empty())
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SystemState;
    use proptest::prelude::*;

    fn engine() -> MigrationEngine {
        MigrationEngine::new(&StoreConfig::default())
    }

    fn user() -> UserId {
        UserId::new("u1")
    }

    #[test]
    fn wraps_legacy_profile() {
        let mut doc = json!({
            "userId": "u1",
            "profile": { "name": "Tomatoes", "cropType": "tomato" }
        });

        let report = engine().migrate(&mut doc, &user()).unwrap();

        assert!(report.applied.contains(&"wrap-legacy-profile"));
        assert!(report.applied.contains(&"ensure-history"));
        assert!(doc.get("profile").is_none());
        assert_eq!(doc["history"], json!([]));

        let profiles = doc["profiles"].as_array().unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0]["name"], "Tomatoes");
        assert_eq!(profiles[0]["cropType"], "tomato");
        let id = profiles[0]["id"].as_str().unwrap();
        assert!(!id.is_empty());
        assert_eq!(doc["activeProfileId"], id);

        let state: SystemState = serde_json::from_value(doc).unwrap();
        assert_eq!(state.active_profile().unwrap().name, "Tomatoes");
    }

    #[test]
    fn legacy_profile_keeps_existing_id_and_gets_default_name() {
        let mut doc = json!({ "profile": { "id": "legacy-1" }, "history": [] });

        engine().migrate(&mut doc, &user()).unwrap();

        assert_eq!(doc["profiles"][0]["id"], "legacy-1");
        assert_eq!(doc["profiles"][0]["name"], "My Garden");
        assert_eq!(doc["activeProfileId"], "legacy-1");
    }

    #[test]
    fn legacy_profile_is_ignored_when_profiles_exist() {
        let mut doc = json!({
            "userId": "u1",
            "profile": { "name": "old" },
            "profiles": [{ "id": "p1", "name": "new" }],
            "activeProfileId": "p1",
            "history": []
        });

        let report = engine().migrate(&mut doc, &user()).unwrap();

        assert!(report.is_noop());
        assert_eq!(doc["profiles"][0]["name"], "new");
    }

    #[test]
    fn current_document_is_untouched() {
        let state = SystemState::new(user(), "My Garden");
        let mut doc = serde_json::to_value(&state).unwrap();

        let report = engine().migrate(&mut doc, &user()).unwrap();

        assert!(report.is_noop());
        assert_eq!(serde_json::from_value::<SystemState>(doc).unwrap(), state);
    }

    #[test]
    fn repairs_dangling_active_profile() {
        let mut doc = json!({
            "userId": "u1",
            "profiles": [{ "id": "p1", "name": "a" }, { "id": "p2", "name": "b" }],
            "activeProfileId": "gone",
            "history": []
        });

        let report = engine().migrate(&mut doc, &user()).unwrap();

        assert_eq!(report.applied, vec!["repair-active-profile"]);
        assert_eq!(doc["activeProfileId"], "p1");
    }

    #[test]
    fn creates_default_profile_when_none() {
        let mut doc = json!({ "userId": "u1", "history": [] });

        engine().migrate(&mut doc, &user()).unwrap();

        assert_eq!(doc["profiles"].as_array().unwrap().len(), 1);
        assert_eq!(doc["profiles"][0]["name"], "My Garden");
        assert_eq!(doc["activeProfileId"], doc["profiles"][0]["id"]);
    }

    #[test]
    fn tags_legacy_diagnoses_and_fills_record_fields() {
        let mut doc = json!({
            "userId": "u1",
            "profiles": [{ "id": "p1", "name": "a" }],
            "activeProfileId": "p1",
            "history": [
                { "id": "r1", "timestamp": 5, "image": "data:,", "diagnosis": { "condition": "rust" } }
            ]
        });

        engine().migrate(&mut doc, &user()).unwrap();

        let record = &doc["history"][0];
        assert_eq!(record["diagnosis"]["schema"], "legacy");
        assert_eq!(record["diagnosis"]["payload"]["condition"], "rust");
        assert_eq!(record["scanType"], "leaf");
        assert_eq!(record["plantId"], "p1");

        let state: SystemState = serde_json::from_value(doc).unwrap();
        assert_eq!(state.history[0].diagnosis.summary(), "rust");
    }

    #[test]
    fn drops_duplicate_history_ids_keeping_newest() {
        let record = |id: &str, ts: u64| {
            json!({
                "id": id, "plantId": "p1", "timestamp": ts, "image": "",
                "scanType": "leaf", "notes": "",
                "diagnosis": { "schema": "legacy", "payload": null }
            })
        };
        let mut doc = json!({
            "userId": "u1",
            "profiles": [{ "id": "p1", "name": "a" }],
            "activeProfileId": "p1",
            "history": [record("a", 3), record("b", 2), record("a", 1)]
        });

        let report = engine().migrate(&mut doc, &user()).unwrap();

        assert_eq!(report.applied, vec!["dedupe-history"]);
        let history = doc["history"].as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["timestamp"], 3);
    }

    #[test]
    fn caps_oversized_growth_history() {
        let growth: Vec<Value> = (0..60)
            .map(|i| json!({ "date": format!("d{i}"), "stage": "veg" }))
            .collect();
        let mut doc = json!({
            "userId": "u1",
            "profiles": [{ "id": "p1", "name": "a", "growthHistory": growth }],
            "activeProfileId": "p1",
            "history": []
        });

        engine().migrate(&mut doc, &user()).unwrap();

        let growth = doc["profiles"][0]["growthHistory"].as_array().unwrap();
        assert_eq!(growth.len(), 50);
        assert_eq!(growth[0]["date"], "d10");
        assert_eq!(growth[49]["date"], "d59");
    }

    #[test]
    fn unknown_or_malformed_diagnoses_become_legacy() {
        let mut doc = json!({
            "userId": "u1",
            "profiles": [{ "id": "p1", "name": "Tomatoes" }],
            "activeProfileId": "p1",
            "history": [
                { "id": "r1", "plantId": "p1", "timestamp": 2, "image": "", "scanType": "leaf",
                  "diagnosis": { "schema": "leaf-v2", "condition": "mildew", "score": 3 } },
                { "id": "r2", "plantId": "p1", "timestamp": 1, "image": "", "scanType": "leaf",
                  "diagnosis": { "schema": "leaf-v1", "confidence": 0.4 } }
            ]
        });

        let report = engine().migrate(&mut doc, &user()).unwrap();

        assert_eq!(report.applied, vec!["normalize-history-records"]);
        assert_eq!(doc["history"][0]["diagnosis"]["schema"], "legacy");
        assert_eq!(doc["history"][0]["diagnosis"]["payload"]["schema"], "leaf-v2");
        assert_eq!(doc["history"][1]["diagnosis"]["payload"]["confidence"], 0.4);

        let state: SystemState = serde_json::from_value(doc).unwrap();
        assert_eq!(state.history.len(), 2);
        assert_eq!(state.history[0].diagnosis.summary(), "mildew");
        assert_eq!(state.profiles[0].name, "Tomatoes");
    }

    #[test]
    fn unreadable_history_record_is_dropped_alone() {
        let mut doc = json!({
            "userId": "u1",
            "profiles": [{ "id": "p1", "name": "a" }],
            "activeProfileId": "p1",
            "history": [
                { "id": "r1", "plantId": "p1", "timestamp": 2, "image": "", "scanType": "leaf",
                  "notes": 17, "diagnosis": { "schema": "legacy", "payload": null } },
                { "id": "r2", "plantId": "p1", "timestamp": 1, "image": "", "scanType": "leaf",
                  "diagnosis": { "schema": "legacy", "payload": null } }
            ]
        });

        let report = engine().migrate(&mut doc, &user()).unwrap();

        assert_eq!(report.applied, vec!["drop-unreadable-history"]);
        let state: SystemState = serde_json::from_value(doc).unwrap();
        assert_eq!(state.history.len(), 1);
        assert_eq!(state.history[0].id, RecordId::new("r2"));
    }

    #[test]
    fn duplicate_profile_ids_keep_the_first() {
        let mut doc = json!({
            "userId": "u1",
            "profiles": [
                { "id": "p1", "name": "Tomatoes" },
                { "id": "p2", "name": "Herbs" },
                { "id": "p1", "name": "Tomatoes (copy)" }
            ],
            "activeProfileId": "p1",
            "history": []
        });

        let report = engine().migrate(&mut doc, &user()).unwrap();

        assert_eq!(report.applied, vec!["dedupe-profiles"]);
        let names: Vec<&str> = doc["profiles"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["Tomatoes", "Herbs"]);
    }

    #[test]
    fn out_of_range_location_is_removed() {
        let mut doc = json!({
            "userId": "u1",
            "profiles": [
                { "id": "p1", "name": "a", "location": { "lat": 95.0, "lon": 0.0 } },
                { "id": "p2", "name": "b", "location": { "lat": 45.0, "lon": 7.5 } }
            ],
            "activeProfileId": "p1",
            "history": []
        });

        let report = engine().migrate(&mut doc, &user()).unwrap();

        assert_eq!(report.applied, vec!["repair-profile-locations"]);
        let state: SystemState = serde_json::from_value(doc).unwrap();
        assert!(state.profiles[0].location.is_none());
        assert_eq!(state.profiles[1].location.as_ref().map(Location::lat), Some(45.0));
    }

    #[test]
    fn unreadable_profiles_are_dropped_and_replaced_when_none_remain() {
        let mut doc = json!({
            "userId": "u1",
            "profiles": [{ "id": "p1", "name": "a", "growthHistory": "not a list" }],
            "activeProfileId": "p1",
            "history": []
        });

        let report = engine().migrate(&mut doc, &user()).unwrap();

        assert!(report.applied.contains(&"drop-unreadable-profiles"));
        let state: SystemState = serde_json::from_value(doc).unwrap();
        assert_eq!(state.profiles.len(), 1);
        assert_eq!(state.profiles[0].name, "My Garden");
        assert_eq!(state.active_profile_id.as_ref(), Some(&state.profiles[0].id));
    }

    #[test]
    fn rejects_non_object_documents() {
        let mut doc = json!([1, 2, 3]);
        assert_eq!(
            engine().migrate(&mut doc, &user()),
            Err(MigrationError::NotAnObject("array"))
        );
    }

    fn arb_profile() -> impl Strategy<Value = Value> {
        // few distinct ids, so profiles often collide
        (
            proptest::option::of("[a-c]{0,1}"),
            proptest::option::of("[A-Za-z ]{0,8}"),
            0usize..60,
            proptest::option::of(-200i32..200),
        )
            .prop_map(|(id, name, growth, lat)| {
                let mut p = Map::new();
                if let Some(id) = id {
                    p.insert("id".into(), json!(id));
                }
                if let Some(lat) = lat {
                    p.insert("location".into(), json!({ "lat": lat, "lon": 10.0 }));
                }
                if let Some(name) = name {
                    p.insert("name".into(), json!(name));
                }
                let entries: Vec<Value> = (0..growth)
                    .map(|i| json!({ "date": format!("d{i}"), "stage": "s" }))
                    .collect();
                p.insert("growthHistory".into(), Value::Array(entries));
                Value::Object(p)
            })
    }

    fn arb_record() -> impl Strategy<Value = Value> {
        (
            proptest::option::of("[a-c]"),
            any::<bool>(),
            proptest::option::of(prop_oneof![Just("leaf"), Just("crop"), Just("bark")]),
            any::<bool>(),
        )
            .prop_map(|(id, tagged, scan, future_schema)| {
                let mut r = Map::new();
                if let Some(id) = id {
                    r.insert("id".into(), json!(id));
                }
                if let Some(scan) = scan {
                    r.insert("scanType".into(), json!(scan));
                }
                let diagnosis = match (tagged, future_schema) {
                    (true, false) => json!({ "schema": "legacy", "payload": { "x": 1 } }),
                    (true, true) => json!({ "schema": "leaf-v9", "condition": "spots" }),
                    (false, _) => json!({ "condition": "spots" }),
                };
                r.insert("diagnosis".into(), diagnosis);
                Value::Object(r)
            })
    }

    fn arb_document() -> impl Strategy<Value = Value> {
        (
            proptest::option::of(arb_profile()),
            proptest::option::of(proptest::collection::vec(arb_profile(), 0..3)),
            proptest::option::of(proptest::collection::vec(arb_record(), 0..6)),
            proptest::option::of("[a-z0-9]{0,4}"),
            proptest::option::of("u[0-9]"),
        )
            .prop_map(|(legacy, profiles, history, active, user)| {
                let mut doc = Map::new();
                if let Some(legacy) = legacy {
                    doc.insert("profile".into(), legacy);
                }
                if let Some(profiles) = profiles {
                    doc.insert("profiles".into(), Value::Array(profiles));
                }
                if let Some(history) = history {
                    doc.insert("history".into(), Value::Array(history));
                }
                if let Some(active) = active {
                    doc.insert("activeProfileId".into(), json!(active));
                }
                if let Some(user) = user {
                    doc.insert("userId".into(), json!(user));
                }
                Value::Object(doc)
            })
    }

    proptest! {
        #[test]
        fn migration_is_idempotent(doc in arb_document()) {
            let engine = engine();
            let mut once = doc;
            engine.migrate(&mut once, &user()).unwrap();

            let mut twice = once.clone();
            let report = engine.migrate(&mut twice, &user()).unwrap();

            prop_assert!(report.is_noop(), "second run applied {:?}", report.applied);
            prop_assert_eq!(&twice, &once);
        }

        #[test]
        fn migrated_documents_satisfy_invariants(doc in arb_document()) {
            let mut doc = doc;
            engine().migrate(&mut doc, &user()).unwrap();

            let state: SystemState = serde_json::from_value(doc).unwrap();
            prop_assert!(!state.profiles.is_empty());
            prop_assert!(state.active_profile().is_some());
            prop_assert!(state.profiles.iter().all(|p| p.growth_history.len() <= 50));

            let mut ids = HashSet::new();
            prop_assert!(state.history.iter().all(|r| ids.insert(r.id.clone())));

            let mut profile_ids = HashSet::new();
            prop_assert!(state.profiles.iter().all(|p| profile_ids.insert(p.id.clone())));
        }
    }
}
