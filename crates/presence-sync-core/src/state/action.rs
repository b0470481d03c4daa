//! Local actions and their translation into deltas.
//!
//! Actions are what a participant's UI asks for; the session validates them
//! against the caller's role and the current state, then turns them into a
//! [`StateDelta`].

use serde_json::Value;

use crate::error::{SyncError, SyncResult};
use crate::state::delta::{StateDelta, DETAIL_KEY, PAYMENT_STEP_KEY};
use crate::types::{JsonMap, Role, SharedState, ViewName};

/// Detail-action names that older clients send with a flat payload.
///
/// These are stored as `{name, ...payload}` directly under `metadata.detail`.
pub const LEGACY_DETAIL_ACTIONS: &[&str] = &[
    "tab-change",
    "section-toggle",
    "tier-select",
    "feature-expand",
];

/// Interaction inside the package detail view
#[derive(Debug, Clone, PartialEq)]
pub enum DetailAction {
    /// Open a package in the detail view
    OpenPackage { package_id: String },
    /// Switch the visible tab
    SelectTab { tab: String },
    /// Set one named field of the detail state
    Field { key: String, value: Value },
    /// Flat `{name, ...payload}` form kept for older clients
    Legacy { name: String, payload: JsonMap },
}

impl DetailAction {
    /// Build an action from a free-form name, routing known legacy names to
    /// the flat passthrough form.
    pub fn from_name(name: impl Into<String>, payload: JsonMap) -> Self {
        let name = name.into();
        if LEGACY_DETAIL_ACTIONS.contains(&name.as_str()) {
            DetailAction::Legacy { name, payload }
        } else {
            DetailAction::Field {
                key: name,
                value: Value::Object(payload),
            }
        }
    }

    /// Entries merged into `metadata.detail`
    pub fn detail_entries(&self) -> JsonMap {
        let mut detail = JsonMap::new();
        match self {
            DetailAction::OpenPackage { package_id } => {
                detail.insert("packageId".into(), Value::String(package_id.clone()));
            }
            DetailAction::SelectTab { tab } => {
                detail.insert("tab".into(), Value::String(tab.clone()));
            }
            DetailAction::Field { key, value } => {
                detail.insert(key.clone(), value.clone());
            }
            DetailAction::Legacy { name, payload } => {
                detail.insert("name".into(), Value::String(name.clone()));
                for (k, v) in payload {
                    detail.insert(k.clone(), v.clone());
                }
            }
        }
        detail
    }
}

/// A state change requested by the local participant
#[derive(Debug, Clone, PartialEq)]
pub enum LocalAction {
    /// Switch the shared view; the name must be allow-listed
    Navigate { view: String, params: JsonMap },
    /// Replace the shared package list
    SharePackages(Vec<String>),
    /// Add the id to the compare set, or remove it if present
    ToggleCompare(String),
    /// Replace the compare set
    SetCompare(Vec<String>),
    /// Add the id to the caller's role selection
    Select(String),
    /// Remove the id from the caller's role selection
    Unselect(String),
    /// Detail view interaction
    Detail(DetailAction),
    /// Replace the payment step
    PaymentStep(String),
    /// Raw partial update
    Patch(StateDelta),
}

impl LocalAction {
    /// Short name used in logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            LocalAction::Navigate { .. } => "navigate",
            LocalAction::SharePackages(_) => "share-packages",
            LocalAction::ToggleCompare(_) => "toggle-compare",
            LocalAction::SetCompare(_) => "set-compare",
            LocalAction::Select(_) => "select",
            LocalAction::Unselect(_) => "unselect",
            LocalAction::Detail(_) => "detail-action",
            LocalAction::PaymentStep(_) => "payment-step",
            LocalAction::Patch(_) => "patch",
        }
    }

    /// Whether only the Authority may perform this action
    pub fn requires_authority(&self) -> bool {
        match self {
            LocalAction::Navigate { .. }
            | LocalAction::SharePackages(_)
            | LocalAction::PaymentStep(_) => true,
            LocalAction::Patch(delta) => {
                delta.view.is_some()
                    || delta.view_params.is_some()
                    || delta.shared_packages.is_some()
                    || delta
                        .metadata
                        .as_ref()
                        .is_some_and(|m| m.contains_key(PAYMENT_STEP_KEY))
            }
            _ => false,
        }
    }

    /// Translate into a delta against the current state.
    ///
    /// Fails without side effects on an unknown view name.
    pub fn to_delta(&self, state: &SharedState, role: Role) -> SyncResult<StateDelta> {
        let delta = match self {
            LocalAction::Navigate { view, params } => {
                let view: ViewName = view.parse()?;
                StateDelta::navigation(view, params.clone())
            }
            LocalAction::SharePackages(packages) => StateDelta::shared_packages(packages.clone()),
            LocalAction::ToggleCompare(id) => {
                let mut set = state.selection.compare_set.clone();
                if let Some(pos) = set.iter().position(|x| x == id) {
                    set.remove(pos);
                } else {
                    set.push(id.clone());
                }
                StateDelta::compare_set(set)
            }
            LocalAction::SetCompare(ids) => StateDelta::compare_set(ids.clone()),
            LocalAction::Select(id) | LocalAction::Unselect(id) => {
                let mut selections = state.selection.user_selections.clone();
                let entry = selections.entry(role).or_default();
                if matches!(self, LocalAction::Select(_)) {
                    entry.insert(id.clone());
                } else {
                    entry.remove(id);
                }
                StateDelta::user_selections(selections)
            }
            LocalAction::Detail(action) => {
                StateDelta::metadata_entry(DETAIL_KEY, Value::Object(action.detail_entries()))
            }
            LocalAction::PaymentStep(step) => {
                StateDelta::metadata_entry(PAYMENT_STEP_KEY, Value::String(step.clone()))
            }
            LocalAction::Patch(delta) => delta.clone(),
        };
        Ok(delta)
    }

    /// Reject the action for `role` if it is authority-only
    pub fn check_permission(&self, role: Role) -> SyncResult<()> {
        if self.requires_authority() && !role.is_authority() {
            return Err(SyncError::NotAuthority(self.name().to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> JsonMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_legacy_detail_nests_flat() {
        let action = DetailAction::from_name("tab-change", obj(json!({"tab": "overview"})));
        assert!(matches!(action, DetailAction::Legacy { .. }));
        assert_eq!(
            Value::Object(action.detail_entries()),
            json!({"name": "tab-change", "tab": "overview"})
        );
    }

    #[test]
    fn test_unknown_detail_name_is_keyed_field() {
        let action = DetailAction::from_name("pricing", obj(json!({"annual": true})));
        assert_eq!(
            Value::Object(action.detail_entries()),
            json!({"pricing": {"annual": true}})
        );
    }

    #[test]
    fn test_toggle_compare_adds_then_removes() {
        let mut state = SharedState::default();
        LocalAction::ToggleCompare("A1".into())
            .to_delta(&state, Role::Authority)
            .unwrap()
            .apply_to(&mut state);
        LocalAction::ToggleCompare("B2".into())
            .to_delta(&state, Role::Authority)
            .unwrap()
            .apply_to(&mut state);
        assert_eq!(state.selection.compare_set, vec!["A1", "B2"]);

        LocalAction::ToggleCompare("A1".into())
            .to_delta(&state, Role::Authority)
            .unwrap()
            .apply_to(&mut state);
        assert_eq!(state.selection.compare_set, vec!["B2"]);
    }

    #[test]
    fn test_select_is_scoped_to_role() {
        let mut state = SharedState::default();
        LocalAction::Select("p1".into())
            .to_delta(&state, Role::Replica)
            .unwrap()
            .apply_to(&mut state);
        LocalAction::Select("p1".into())
            .to_delta(&state, Role::Replica)
            .unwrap()
            .apply_to(&mut state);

        assert_eq!(state.selection.user_selections[&Role::Replica].len(), 1);
        assert!(!state.selection.user_selections.contains_key(&Role::Authority));

        LocalAction::Unselect("p1".into())
            .to_delta(&state, Role::Replica)
            .unwrap()
            .apply_to(&mut state);
        assert!(state.selection.user_selections[&Role::Replica].is_empty());
    }

    #[test]
    fn test_navigate_rejects_unknown_view() {
        let state = SharedState::default();
        let action = LocalAction::Navigate {
            view: "backstage".into(),
            params: JsonMap::new(),
        };
        assert!(matches!(
            action.to_delta(&state, Role::Authority),
            Err(SyncError::UnknownView(_))
        ));
    }

    #[test]
    fn test_permission_gate() {
        let nav = LocalAction::Navigate {
            view: "home".into(),
            params: JsonMap::new(),
        };
        assert!(nav.check_permission(Role::Authority).is_ok());
        assert!(matches!(
            nav.check_permission(Role::Replica),
            Err(SyncError::NotAuthority(op)) if op == "navigate"
        ));
        assert!(LocalAction::ToggleCompare("x".into())
            .check_permission(Role::Replica)
            .is_ok());

        let sneaky = LocalAction::Patch(StateDelta::metadata_entry(
            PAYMENT_STEP_KEY,
            json!("confirm"),
        ));
        assert!(sneaky.check_permission(Role::Replica).is_err());
    }
}
