//! Field-level diff and the create/update/no-op decision.
//!
//! Updates must be minimal: only fields whose desired value differs from
//! the current remote value are patched. Equality applies the same
//! canonicalization used for writes, and any two "empty" representations
//! compare equal, so representation noise never produces a patch.
//!
//! Descriptions are write-once: set at create, never diffed. They render
//! the same source fields the field diff already covers.

use std::collections::BTreeMap;

use ordsync_client::api::{ItemPatch, RemoteItem};
use ordsync_core::types::{values_equal, EpicPlan, FieldValue, StoryPlan};

/// What the executor should do for one planned item.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// No remote identity exists; the item must be created.
    Create,
    /// The item exists and differs; apply the minimal patch.
    Update { patch: ItemPatch },
    /// The item exists and matches the plan.
    NoOp,
}

impl Decision {
    fn from_patch(patch: ItemPatch) -> Self {
        if patch.is_empty() {
            Decision::NoOp
        } else {
            Decision::Update { patch }
        }
    }
}

/// Decide for an epic plan against the current remote state.
pub fn decide_epic(plan: &EpicPlan, current: &RemoteItem) -> Decision {
    Decision::from_patch(patch_against(&plan.subject, &plan.fields, current))
}

/// Decide for a story plan against the current remote state.
pub fn decide_story(plan: &StoryPlan, current: &RemoteItem) -> Decision {
    Decision::from_patch(patch_against(&plan.subject, &plan.fields, current))
}

/// Minimal patch that would move `current` to the desired state. Empty when
/// nothing differs. The executor re-invokes this after conflict re-fetches.
pub fn patch_against(
    subject: &str,
    desired: &BTreeMap<String, FieldValue>,
    current: &RemoteItem,
) -> ItemPatch {
    let mut patch = ItemPatch::default();
    if subject != current.subject {
        patch.subject = Some(subject.to_string());
    }
    patch.fields = diff_fields(desired, &current.fields);
    patch
}

/// Desired-vs-current field comparison. Only fields the plan carries are
/// considered; fields only present remotely are left alone.
pub fn diff_fields(
    desired: &BTreeMap<String, FieldValue>,
    current: &BTreeMap<String, FieldValue>,
) -> BTreeMap<String, FieldValue> {
    desired
        .iter()
        .filter(|(remote_id, value)| !values_equal(Some(value), current.get(*remote_id)))
        .map(|(remote_id, value)| (remote_id.clone(), value.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
