//! Partial state updates and their merge policy.
//!
//! A [`StateDelta`] names only the top-level slices that changed. Applying it
//! follows a per-slice policy:
//!
//! ```text
//! view, viewParams, sharedPackages  -> wholesale replace
//! selection                         -> merge by sub-key (userSelections, compareSet)
//! scrollPositions, cursors          -> merge by container / user id
//! metadata                          -> merge by key, `detail` merged one level deeper
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{CursorPosition, JsonMap, Role, ScrollPosition, SharedState, ViewName};

/// Metadata key holding detail-view state
pub const DETAIL_KEY: &str = "detail";

/// Metadata key holding the current payment step
pub const PAYMENT_STEP_KEY: &str = "paymentStep";

/// Partial update of the selection slice
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_selections: Option<BTreeMap<Role, BTreeSet<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compare_set: Option<Vec<String>>,
}

/// A partial-state update naming only changed keys
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view: Option<ViewName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_params: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_packages: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionDelta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scroll_positions: Option<BTreeMap<String, ScrollPosition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursors: Option<BTreeMap<String, CursorPosition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonMap>,
}

impl StateDelta {
    /// Navigate to `view` with opaque params
    pub fn navigation(view: ViewName, params: JsonMap) -> Self {
        Self {
            view: Some(view),
            view_params: Some(params),
            ..Default::default()
        }
    }

    /// Replace the shared package list
    pub fn shared_packages(packages: Vec<String>) -> Self {
        Self {
            shared_packages: Some(packages),
            ..Default::default()
        }
    }

    /// Replace the compare set
    pub fn compare_set(ids: Vec<String>) -> Self {
        Self {
            selection: Some(SelectionDelta {
                compare_set: Some(ids),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Replace the per-role selection map
    pub fn user_selections(selections: BTreeMap<Role, BTreeSet<String>>) -> Self {
        Self {
            selection: Some(SelectionDelta {
                user_selections: Some(selections),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Set a single metadata key
    pub fn metadata_entry(key: impl Into<String>, value: Value) -> Self {
        let mut map = JsonMap::new();
        map.insert(key.into(), value);
        Self {
            metadata: Some(map),
            ..Default::default()
        }
    }

    /// Record one container's scroll position
    pub fn scroll(container_id: impl Into<String>, position: ScrollPosition) -> Self {
        Self {
            scroll_positions: Some(BTreeMap::from([(container_id.into(), position)])),
            ..Default::default()
        }
    }

    /// Record one participant's cursor
    pub fn cursor(user_id: impl Into<String>, position: CursorPosition) -> Self {
        Self {
            cursors: Some(BTreeMap::from([(user_id.into(), position)])),
            ..Default::default()
        }
    }

    /// True when the delta names no keys
    pub fn is_empty(&self) -> bool {
        self.view.is_none()
            && self.view_params.is_none()
            && self.shared_packages.is_none()
            && self.selection.is_none()
            && self.scroll_positions.is_none()
            && self.cursors.is_none()
            && self.metadata.is_none()
    }

    /// Merge this delta into `state`.
    ///
    /// Does not touch `seq` or `lastUpdatedBy`; the caller owns versioning.
    pub fn apply_to(&self, state: &mut SharedState) {
        if let Some(view) = self.view {
            state.view = view;
        }
        if let Some(params) = &self.view_params {
            state.view_params = params.clone();
        }
        if let Some(packages) = &self.shared_packages {
            state.shared_packages = packages.clone();
        }
        if let Some(selection) = &self.selection {
            if let Some(user_selections) = &selection.user_selections {
                state.selection.user_selections = user_selections.clone();
            }
            if let Some(compare_set) = &selection.compare_set {
                state.selection.compare_set = dedup_ordered(compare_set);
            }
        }
        if let Some(scroll) = &self.scroll_positions {
            for (container, position) in scroll {
                state.scroll_positions.insert(container.clone(), *position);
            }
        }
        if let Some(cursors) = &self.cursors {
            for (user, position) in cursors {
                state.cursors.insert(user.clone(), *position);
            }
        }
        if let Some(metadata) = &self.metadata {
            merge_metadata(&mut state.metadata, metadata);
        }
    }
}

fn merge_metadata(target: &mut JsonMap, incoming: &JsonMap) {
    for (key, value) in incoming {
        match (key.as_str(), target.get_mut(key), value) {
            (DETAIL_KEY, Some(Value::Object(existing)), Value::Object(update)) => {
                for (k, v) in update {
                    existing.insert(k.clone(), v.clone());
                }
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Drop repeated ids, keeping first occurrences in order
pub fn dedup_ordered(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(value: Value) -> StateDelta {
        StateDelta {
            metadata: value.as_object().cloned(),
            ..Default::default()
        }
    }

    #[test]
    fn test_metadata_is_additive() {
        let mut state = SharedState::default();
        meta(json!({"a": 1})).apply_to(&mut state);
        meta(json!({"b": 2})).apply_to(&mut state);

        assert_eq!(Value::Object(state.metadata), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_metadata_detail_merges_one_level() {
        let mut state = SharedState::default();
        meta(json!({"detail": {"tab": "overview", "nested": {"x": 1}}})).apply_to(&mut state);
        meta(json!({"detail": {"expanded": true, "nested": {"y": 2}}})).apply_to(&mut state);

        assert_eq!(
            state.metadata["detail"],
            json!({"tab": "overview", "expanded": true, "nested": {"y": 2}})
        );
    }

    #[test]
    fn test_metadata_non_detail_objects_replace() {
        let mut state = SharedState::default();
        meta(json!({"other": {"a": 1}})).apply_to(&mut state);
        meta(json!({"other": {"b": 2}})).apply_to(&mut state);

        assert_eq!(state.metadata["other"], json!({"b": 2}));
    }

    #[test]
    fn test_other_keys_replace_wholesale() {
        let mut state = SharedState::default();
        StateDelta::shared_packages(vec!["p1".into(), "p2".into()]).apply_to(&mut state);
        StateDelta::shared_packages(vec!["p3".into()]).apply_to(&mut state);
        assert_eq!(state.shared_packages, vec!["p3".to_string()]);

        let params = json!({"page": 2}).as_object().cloned().unwrap();
        StateDelta::navigation(ViewName::Catalog, params).apply_to(&mut state);
        StateDelta::navigation(ViewName::Compare, JsonMap::new()).apply_to(&mut state);
        assert_eq!(state.view, ViewName::Compare);
        assert!(state.view_params.is_empty());
    }

    #[test]
    fn test_selection_keeps_untouched_sub_key() {
        let mut state = SharedState::default();
        let mut selections = BTreeMap::new();
        selections.insert(Role::Replica, BTreeSet::from(["p1".to_string()]));
        StateDelta::user_selections(selections).apply_to(&mut state);
        StateDelta::compare_set(vec!["A1".into(), "A1".into(), "B2".into()]).apply_to(&mut state);

        assert_eq!(state.selection.compare_set, vec!["A1", "B2"]);
        assert!(state.selection.user_selections[&Role::Replica].contains("p1"));
    }

    #[test]
    fn test_scroll_and_cursor_merge_by_key() {
        let mut state = SharedState::default();
        StateDelta::scroll("main", ScrollPosition { percent_y: 0.5, ..Default::default() })
            .apply_to(&mut state);
        StateDelta::scroll("side", ScrollPosition { percent_y: 0.1, ..Default::default() })
            .apply_to(&mut state);
        StateDelta::cursor("u1", CursorPosition::default()).apply_to(&mut state);

        assert_eq!(state.scroll_positions.len(), 2);
        assert_eq!(state.scroll_positions["main"].percent_y, 0.5);
        assert!(state.cursors.contains_key("u1"));
    }

    #[test]
    fn test_delta_wire_omits_absent_keys() {
        let delta = StateDelta::metadata_entry(PAYMENT_STEP_KEY, json!("review"));
        let json = serde_json::to_value(&delta).unwrap();
        assert_eq!(json, json!({"metadata": {"paymentStep": "review"}}));
        assert!(!delta.is_empty());
        assert!(StateDelta::default().is_empty());
    }

    #[test]
    fn test_delta_ignores_unknown_keys() {
        let delta: StateDelta =
            serde_json::from_value(json!({"sharedPackages": ["x"], "futureKey": 1})).unwrap();
        assert_eq!(delta.shared_packages, Some(vec!["x".to_string()]));
    }
}
