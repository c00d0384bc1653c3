use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Value object: Flow ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowId(pub String);

/// Value object: Flow version ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowVersionId(pub String);

/// Value object: Project ID, the ownership scope supplied by the auth layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectId(pub String);

/// Lifecycle state of a flow version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowVersionState {
    /// The single mutable head; operations may be applied
    Draft,
    /// The single published version; immutable
    Published,
    /// A superseded published version; immutable, kept for history
    Locked,
}

/// Identity for a user-authored automation; owns a sequence of versions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    /// Unique identifier
    pub id: FlowId,

    /// Owning project
    pub project_id: ProjectId,

    /// The currently published version, if any
    pub published_version_id: Option<FlowVersionId>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Flow {
    /// Create a new flow owned by the given project
    pub fn new(project_id: ProjectId) -> Self {
        let now = Utc::now();
        Self {
            id: FlowId(Uuid::new_v4().to_string()),
            project_id,
            published_version_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The reserved name of the trigger node; it is the root of every step tree
pub const TRIGGER_STEP_NAME: &str = "trigger";

/// A step tree: one trigger node and a nested sequence of steps
///
/// The tree is acyclic by construction (children and successors are owned),
/// and every non-root step is reachable from the trigger through exactly one
/// parent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowVersion {
    /// Unique identifier
    pub id: FlowVersionId,

    /// The flow this version belongs to
    pub flow_id: FlowId,

    /// Human-readable name
    pub display_name: String,

    /// The root of the step tree
    pub trigger: Trigger,

    /// Lifecycle state
    pub state: FlowVersionState,

    /// Whether the version currently passes structural validation
    pub valid: bool,

    /// Monotonic counter for step name assignment. Never decremented, so a
    /// step name is never reused even after the step is deleted.
    pub next_step_index: u32,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

/// The trigger node at the root of a step tree
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trigger {
    /// Stable name; always [`TRIGGER_STEP_NAME`]
    pub name: String,

    /// Human-readable name
    pub display_name: String,

    /// Trigger configuration
    pub settings: serde_json::Value,

    /// Head of the top-level step chain
    pub next: Option<Box<Step>>,
}

/// A step node in the tree
///
/// `name` is the stable identifier assigned at creation and never reused,
/// even if the step is later moved or renamed. It is the join key for
/// sampled test output and for parent references in mutation requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    /// Stable identifier, e.g. `step_3`
    pub name: String,

    /// Human-readable name; may change freely
    pub display_name: String,

    /// Step configuration
    pub settings: serde_json::Value,

    /// Node kind and its children
    #[serde(flatten)]
    pub kind: StepKind,

    /// The next step in the same sequence
    pub next: Option<Box<Step>>,
}

/// Closed set of step node kinds, exhaustively matched everywhere
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    /// A unit of work dispatched to the engine
    Action,

    /// Two-way conditional
    Branch {
        /// Steps executed when the condition holds
        on_true: Option<Box<Step>>,
        /// Steps executed otherwise
        on_false: Option<Box<Step>>,
    },

    /// N-way split over named branches
    Split {
        /// The named branches of the split
        branches: Vec<SplitBranch>,
    },

    /// Loop over items; the body executes once per item
    Loop {
        /// Head of the loop body chain
        body: Option<Box<Step>>,
    },
}

/// One named branch of a split step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SplitBranch {
    /// Branch name, unique within the split
    pub name: String,

    /// Head of the branch's step chain
    pub steps: Option<Box<Step>>,
}

impl FlowVersion {
    /// Create a new empty draft version for a flow
    pub fn new_draft(flow_id: FlowId, display_name: String) -> Self {
        let now = Utc::now();
        Self {
            id: FlowVersionId(Uuid::new_v4().to_string()),
            flow_id,
            display_name,
            trigger: Trigger {
                name: TRIGGER_STEP_NAME.to_string(),
                display_name: "Trigger".to_string(),
                settings: serde_json::Value::Object(serde_json::Map::new()),
                next: None,
            },
            state: FlowVersionState::Draft,
            valid: false,
            next_step_index: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Clone this version's content into a fresh draft with a new identity
    pub fn reopen_as_draft(&self) -> Self {
        let mut draft = self.clone();
        draft.id = FlowVersionId(Uuid::new_v4().to_string());
        draft.state = FlowVersionState::Draft;
        draft.created_at = Utc::now();
        draft.updated_at = draft.created_at;
        draft
    }

    /// Assign the next step name, advancing the counter
    pub fn assign_step_name(&mut self) -> String {
        let name = format!("step_{}", self.next_step_index);
        self.next_step_index += 1;
        name
    }

    /// All steps in execution (prefix) order, trigger excluded
    pub fn steps(&self) -> Vec<&Step> {
        let mut out = Vec::new();
        if let Some(head) = &self.trigger.next {
            head.collect(&mut out);
        }
        out
    }

    /// The names of all steps in execution order
    pub fn step_names(&self) -> Vec<String> {
        self.steps().iter().map(|s| s.name.clone()).collect()
    }

    /// Find a step by its stable name
    pub fn find_step(&self, name: &str) -> Option<&Step> {
        self.steps().into_iter().find(|s| s.name == name)
    }

    /// Find a step by its stable name, mutably
    pub fn find_step_mut(&mut self, name: &str) -> Option<&mut Step> {
        self.trigger.next.as_deref_mut()?.find_mut(name)
    }

    /// Refresh the updated timestamp
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl Step {
    /// Create a new action step
    pub fn action(name: String, display_name: String, settings: serde_json::Value) -> Self {
        Self {
            name,
            display_name,
            settings,
            kind: StepKind::Action,
            next: None,
        }
    }

    /// Visit this step, its children, then its successors, in prefix order
    pub fn collect<'a>(&'a self, out: &mut Vec<&'a Step>) {
        out.push(self);
        match &self.kind {
            StepKind::Action => {}
            StepKind::Branch { on_true, on_false } => {
                if let Some(s) = on_true {
                    s.collect(out);
                }
                if let Some(s) = on_false {
                    s.collect(out);
                }
            }
            StepKind::Split { branches } => {
                for branch in branches {
                    if let Some(s) = &branch.steps {
                        s.collect(out);
                    }
                }
            }
            StepKind::Loop { body } => {
                if let Some(s) = body {
                    s.collect(out);
                }
            }
        }
        if let Some(next) = &self.next {
            next.collect(out);
        }
    }

    /// Find a step by name within this subtree and its successors
    pub fn find_mut(&mut self, name: &str) -> Option<&mut Step> {
        if self.name == name {
            return Some(self);
        }
        match &mut self.kind {
            StepKind::Action => {}
            StepKind::Branch { on_true, on_false } => {
                if let Some(found) = on_true.as_deref_mut().and_then(|s| s.find_mut(name)) {
                    return Some(found);
                }
                if let Some(found) = on_false.as_deref_mut().and_then(|s| s.find_mut(name)) {
                    return Some(found);
                }
            }
            StepKind::Split { branches } => {
                for branch in branches {
                    if let Some(found) = branch.steps.as_deref_mut().and_then(|s| s.find_mut(name))
                    {
                        return Some(found);
                    }
                }
            }
            StepKind::Loop { body } => {
                if let Some(found) = body.as_deref_mut().and_then(|s| s.find_mut(name)) {
                    return Some(found);
                }
            }
        }
        self.next.as_deref_mut().and_then(|s| s.find_mut(name))
    }
}
