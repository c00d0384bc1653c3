//! Typed flow mutation operations and the pure applier
//!
//! `apply` is a total, deterministic function of `(version, operation)` with
//! no I/O and no hidden state, so the edit lock in the application layer is
//! the only synchronization primitive the mutation path needs.

use serde::{Deserialize, Serialize};

use super::flow::{
    FlowVersion, SplitBranch, Step, StepKind, Trigger, TRIGGER_STEP_NAME,
};
use crate::EngineError;

/// Where to insert a new step relative to its parent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "location", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepLocation {
    /// Directly after the parent in the same sequence
    After,
    /// At the head of a branch step's true arm
    InsideTrueBranch,
    /// At the head of a branch step's false arm
    InsideFalseBranch,
    /// At the head of a loop step's body
    InsideLoop,
    /// At the head of the named arm of a split step
    InsideSplitBranch {
        /// Name of the split branch to insert into
        branch: String,
    },
}

/// Specification of a step to create; the engine assigns the stable name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewStepSpec {
    /// Human-readable name
    pub display_name: String,

    /// Step configuration
    pub settings: serde_json::Value,

    /// Which node kind to create
    pub kind: NewStepKind,
}

/// Node kind for a step created through [`FlowOperation::AddAction`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NewStepKind {
    /// A plain action
    Action,
    /// A two-way branch with empty arms
    Branch,
    /// A split with the given branch names and empty arms
    Split {
        /// Names for the split's branches
        branches: Vec<String>,
    },
    /// A loop with an empty body
    Loop,
}

/// Request to add a step, addressed by parent step name plus locator
///
/// Raw tree indices are never accepted; they are invalidated by concurrent
/// edits, while stable names are not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddActionRequest {
    /// Stable name of the parent step, or `trigger`
    pub parent_step: String,

    /// Insertion locator relative to the parent
    #[serde(flatten)]
    pub location: StepLocation,

    /// The step to create
    pub action: NewStepSpec,
}

/// Request to update a step's mutable fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStepRequest {
    /// Stable name of the step to update
    pub name: String,

    /// New human-readable name
    pub display_name: String,

    /// New configuration
    pub settings: serde_json::Value,
}

/// Request to update the trigger node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateTriggerRequest {
    /// New human-readable name
    pub display_name: String,

    /// New trigger configuration
    pub settings: serde_json::Value,
}

/// A complete inbound flow template for wholesale import
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowTemplate {
    /// Display name for the imported flow
    pub display_name: String,

    /// The full step tree, trigger included
    pub trigger: Trigger,
}

/// A tagged request describing one edit to a draft version
///
/// Operations are the only permitted way to mutate a draft; adding a kind is
/// a compile-time-checked change because every consumer matches exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowOperation {
    /// Insert a new step under a parent
    AddAction(AddActionRequest),
    /// Update an existing step
    UpdateStep(UpdateStepRequest),
    /// Delete a step and its subtree
    DeleteStep {
        /// Stable name of the step to delete
        name: String,
    },
    /// Update the trigger node
    UpdateTrigger(UpdateTriggerRequest),
    /// Rename the version
    SetDisplayName {
        /// The new display name
        display_name: String,
    },
    /// Replace the entire tree with a validated template
    ImportFlow(FlowTemplate),
}

/// Apply one operation to a version, producing the new version
///
/// Stale step references surface as [`EngineError::StepNotFound`]; this is
/// expected under concurrent edits and is a client error, not a fault.
pub fn apply(version: &FlowVersion, operation: &FlowOperation) -> Result<FlowVersion, EngineError> {
    let mut updated = version.clone();

    match operation {
        FlowOperation::AddAction(request) => {
            add_step(&mut updated, request)?;
        }
        FlowOperation::UpdateStep(request) => {
            let step = updated
                .find_step_mut(&request.name)
                .ok_or_else(|| EngineError::StepNotFound(request.name.clone()))?;
            step.display_name = request.display_name.clone();
            step.settings = request.settings.clone();
        }
        FlowOperation::DeleteStep { name } => {
            remove_step(&mut updated.trigger.next, name)
                .ok_or_else(|| EngineError::StepNotFound(name.clone()))?;
        }
        FlowOperation::UpdateTrigger(request) => {
            updated.trigger.display_name = request.display_name.clone();
            updated.trigger.settings = request.settings.clone();
        }
        FlowOperation::SetDisplayName { display_name } => {
            updated.display_name = display_name.clone();
        }
        FlowOperation::ImportFlow(template) => {
            let violations = validate_template(template);
            if !violations.is_empty() {
                return Err(EngineError::InvalidTemplate(violations));
            }
            updated.display_name = template.display_name.clone();
            updated.trigger = template.trigger.clone();
            updated.next_step_index = next_free_step_index(&updated);
        }
    }

    updated.valid = true;
    updated.touch();
    Ok(updated)
}

/// Validate an inbound template, returning every violated rule
///
/// Callers must surface the full list at once, never just the first entry.
pub fn validate_template(template: &FlowTemplate) -> Vec<String> {
    let mut violations = Vec::new();

    if template.display_name.trim().is_empty() {
        violations.push("display_name: must not be empty".to_string());
    }
    if template.trigger.name != TRIGGER_STEP_NAME {
        violations.push(format!(
            "trigger.name: must be \"{}\", got \"{}\"",
            TRIGGER_STEP_NAME, template.trigger.name
        ));
    }
    if template.trigger.display_name.trim().is_empty() {
        violations.push("trigger.display_name: must not be empty".to_string());
    }
    if !template.trigger.settings.is_object() {
        violations.push("trigger.settings: must be an object".to_string());
    }

    let mut steps = Vec::new();
    if let Some(head) = &template.trigger.next {
        head.collect(&mut steps);
    }

    let mut seen = std::collections::HashSet::new();
    for step in &steps {
        if step.name.trim().is_empty() {
            violations.push("step: name must not be empty".to_string());
        } else if step.name == TRIGGER_STEP_NAME {
            violations.push(format!("{}: step name is reserved", step.name));
        } else if !seen.insert(step.name.as_str()) {
            violations.push(format!("{}: duplicate step name", step.name));
        }
        if step.display_name.trim().is_empty() {
            violations.push(format!("{}: display_name must not be empty", step.name));
        }
        if !step.settings.is_object() {
            violations.push(format!("{}: settings must be an object", step.name));
        }
        if let StepKind::Split { branches } = &step.kind {
            if branches.len() < 2 {
                violations.push(format!("{}: split must have at least two branches", step.name));
            }
            let mut branch_names = std::collections::HashSet::new();
            for branch in branches {
                if !branch_names.insert(branch.name.as_str()) {
                    violations.push(format!(
                        "{}: duplicate split branch name \"{}\"",
                        step.name, branch.name
                    ));
                }
            }
        }
    }

    violations
}

fn add_step(version: &mut FlowVersion, request: &AddActionRequest) -> Result<(), EngineError> {
    check_parent(version, request)?;

    let name = version.assign_step_name();
    let new_step = build_step(name, &request.action);

    if request.parent_step == TRIGGER_STEP_NAME {
        push_front(&mut version.trigger.next, new_step);
        return Ok(());
    }

    let parent = version
        .find_step_mut(&request.parent_step)
        .ok_or_else(|| EngineError::StepNotFound(request.parent_step.clone()))?;

    match (&request.location, &mut parent.kind) {
        (StepLocation::After, _) => {
            push_front(&mut parent.next, new_step);
        }
        (StepLocation::InsideTrueBranch, StepKind::Branch { on_true, .. }) => {
            push_front(on_true, new_step);
        }
        (StepLocation::InsideFalseBranch, StepKind::Branch { on_false, .. }) => {
            push_front(on_false, new_step);
        }
        (StepLocation::InsideLoop, StepKind::Loop { body }) => {
            push_front(body, new_step);
        }
        (StepLocation::InsideSplitBranch { branch }, StepKind::Split { branches }) => {
            let arm = branches
                .iter_mut()
                .find(|b| &b.name == branch)
                .ok_or_else(|| {
                    EngineError::Internal(format!("split branch {} vanished mid-apply", branch))
                })?;
            push_front(&mut arm.steps, new_step);
        }
        // check_parent already rejected kind/locator mismatches
        (location, _) => {
            return Err(EngineError::Internal(format!(
                "locator {:?} passed validation against an incompatible step kind",
                location
            )))
        }
    }

    Ok(())
}

/// Reject kind/locator mismatches up front so the mutation below cannot
/// partially apply.
fn check_parent(version: &FlowVersion, request: &AddActionRequest) -> Result<(), EngineError> {
    if request.parent_step == TRIGGER_STEP_NAME {
        return match request.location {
            StepLocation::After => Ok(()),
            _ => Err(EngineError::Validation(vec![format!(
                "{}: only AFTER insertion is valid under the trigger",
                request.parent_step
            )])),
        };
    }

    let parent = version
        .find_step(&request.parent_step)
        .ok_or_else(|| EngineError::StepNotFound(request.parent_step.clone()))?;

    let compatible = match (&request.location, &parent.kind) {
        (StepLocation::After, _) => true,
        (StepLocation::InsideTrueBranch, StepKind::Branch { .. }) => true,
        (StepLocation::InsideFalseBranch, StepKind::Branch { .. }) => true,
        (StepLocation::InsideLoop, StepKind::Loop { .. }) => true,
        (StepLocation::InsideSplitBranch { branch }, StepKind::Split { branches }) => {
            if !branches.iter().any(|b| &b.name == branch) {
                return Err(EngineError::Validation(vec![format!(
                    "{}: split has no branch named \"{}\"",
                    parent.name, branch
                )]));
            }
            true
        }
        _ => false,
    };

    if !compatible {
        return Err(EngineError::Validation(vec![format!(
            "{}: locator {:?} is not valid for this step kind",
            parent.name, request.location
        )]));
    }

    Ok(())
}

fn build_step(name: String, spec: &NewStepSpec) -> Step {
    let kind = match &spec.kind {
        NewStepKind::Action => StepKind::Action,
        NewStepKind::Branch => StepKind::Branch {
            on_true: None,
            on_false: None,
        },
        NewStepKind::Split { branches } => StepKind::Split {
            branches: branches
                .iter()
                .map(|name| SplitBranch {
                    name: name.clone(),
                    steps: None,
                })
                .collect(),
        },
        NewStepKind::Loop => StepKind::Loop { body: None },
    };

    Step {
        name,
        display_name: spec.display_name.clone(),
        settings: spec.settings.clone(),
        kind,
        next: None,
    }
}

/// Link a step in at the head of a chain
fn push_front(chain: &mut Option<Box<Step>>, mut step: Step) {
    step.next = chain.take();
    *chain = Some(Box::new(step));
}

/// Unlink the named step from wherever it sits, dropping its children but
/// keeping its successors in place. Returns the removed step.
fn remove_step(chain: &mut Option<Box<Step>>, name: &str) -> Option<Step> {
    if chain.as_ref().is_some_and(|s| s.name == name) {
        if let Some(mut removed) = chain.take() {
            *chain = removed.next.take();
            return Some(*removed);
        }
    }

    let step = chain.as_deref_mut()?;
    match &mut step.kind {
        StepKind::Action => {}
        StepKind::Branch { on_true, on_false } => {
            if let Some(removed) = remove_step(on_true, name) {
                return Some(removed);
            }
            if let Some(removed) = remove_step(on_false, name) {
                return Some(removed);
            }
        }
        StepKind::Split { branches } => {
            for branch in branches {
                if let Some(removed) = remove_step(&mut branch.steps, name) {
                    return Some(removed);
                }
            }
        }
        StepKind::Loop { body } => {
            if let Some(removed) = remove_step(body, name) {
                return Some(removed);
            }
        }
    }
    remove_step(&mut step.next, name)
}

/// Smallest counter value that cannot collide with any imported `step_N` name
fn next_free_step_index(version: &FlowVersion) -> u32 {
    version
        .steps()
        .iter()
        .filter_map(|s| s.name.strip_prefix("step_"))
        .filter_map(|n| n.parse::<u32>().ok())
        .max()
        .map(|max| max + 1)
        .unwrap_or(1)
}
