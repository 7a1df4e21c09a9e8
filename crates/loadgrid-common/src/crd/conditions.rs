//! Condition tracking for TestRun status
//!
//! Conditions are a fixed table indexed by [`ConditionKind`]: every kind has
//! exactly one slot, so lookups are O(1) and a new kind forces every `match`
//! to be revisited. On the wire the table is a plain Kubernetes-style list.
//!
//! The transition time of a slot moves only when its status actually changes.
//! Writing the current value again is a no-op, which is what the controller's
//! timeout policies depend on.

use chrono::{DateTime, Utc};
use schemars::gen::SchemaGenerator;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Closed set of condition kinds tracked on a TestRun
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ConditionKind {
    /// Runners have been started and the test is executing
    Running,
    /// The run reports to the cloud service
    CloudTestRun,
    /// The run has been registered with the cloud service
    CloudTestRunCreated,
    /// The run executes in a private load zone and needs a setup step
    #[serde(rename = "CloudPLZTestRun")]
    CloudPlzTestRun,
    /// The cloud service asked for the run to be aborted
    CloudTestRunAborted,
}

impl ConditionKind {
    /// Number of condition kinds
    pub const COUNT: usize = 5;

    /// All kinds, in table order
    pub const ALL: [ConditionKind; Self::COUNT] = [
        ConditionKind::Running,
        ConditionKind::CloudTestRun,
        ConditionKind::CloudTestRunCreated,
        ConditionKind::CloudPlzTestRun,
        ConditionKind::CloudTestRunAborted,
    ];

    fn index(self) -> usize {
        match self {
            ConditionKind::Running => 0,
            ConditionKind::CloudTestRun => 1,
            ConditionKind::CloudTestRunCreated => 2,
            ConditionKind::CloudPlzTestRun => 3,
            ConditionKind::CloudTestRunAborted => 4,
        }
    }
}

impl std::fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "Running"),
            Self::CloudTestRun => write!(f, "CloudTestRun"),
            Self::CloudTestRunCreated => write!(f, "CloudTestRunCreated"),
            Self::CloudPlzTestRun => write!(f, "CloudPLZTestRun"),
            Self::CloudTestRunAborted => write!(f, "CloudTestRunAborted"),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Wire representation of a single condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Kind of condition
    #[serde(rename = "type")]
    pub type_: ConditionKind,

    /// Status of the condition
    pub status: ConditionStatus,

    /// Last time the status changed; absent if it never did
    #[serde(
        rename = "lastTransitionTime",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_transition_time: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct Slot {
    status: ConditionStatus,
    last_transition: Option<DateTime<Utc>>,
}

/// Fixed table of conditions, one slot per [`ConditionKind`]
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(from = "Vec<Condition>", into = "Vec<Condition>")]
pub struct Conditions {
    slots: [Slot; ConditionKind::COUNT],
}

impl Conditions {
    /// Current status of `kind`
    pub fn status(&self, kind: ConditionKind) -> ConditionStatus {
        self.slots[kind.index()].status
    }

    /// True if `kind` is currently `True`
    pub fn is_true(&self, kind: ConditionKind) -> bool {
        self.status(kind) == ConditionStatus::True
    }

    /// True if `kind` is currently `Unknown`
    pub fn is_unknown(&self, kind: ConditionKind) -> bool {
        self.status(kind) == ConditionStatus::Unknown
    }

    /// Set `kind` to `status`, stamping `now` only if the value changed.
    ///
    /// Returns whether a transition happened.
    pub fn set(
        &mut self,
        kind: ConditionKind,
        status: impl Into<ConditionStatus>,
        now: DateTime<Utc>,
    ) -> bool {
        let status = status.into();
        let slot = &mut self.slots[kind.index()];
        if slot.status == status {
            return false;
        }
        slot.status = status;
        slot.last_transition = Some(now);
        true
    }

    /// When `kind` last changed value, if it ever did
    pub fn last_transition(&self, kind: ConditionKind) -> Option<DateTime<Utc>> {
        self.slots[kind.index()].last_transition
    }

    /// Time elapsed between the last transition of `kind` and `now`
    pub fn since_transition(
        &self,
        kind: ConditionKind,
        now: DateTime<Utc>,
    ) -> Option<chrono::Duration> {
        self.last_transition(kind).map(|t| now - t)
    }

    /// Iterate conditions in table order
    pub fn iter(&self) -> impl Iterator<Item = Condition> + '_ {
        ConditionKind::ALL.iter().map(|&kind| {
            let slot = self.slots[kind.index()];
            Condition {
                type_: kind,
                status: slot.status,
                last_transition_time: slot.last_transition,
            }
        })
    }
}

impl From<Vec<Condition>> for Conditions {
    fn from(list: Vec<Condition>) -> Self {
        let mut conditions = Conditions::default();
        // duplicates are collapsed, last entry wins
        for c in list {
            conditions.slots[c.type_.index()] = Slot {
                status: c.status,
                last_transition: c.last_transition_time,
            };
        }
        conditions
    }
}

impl From<Conditions> for Vec<Condition> {
    fn from(conditions: Conditions) -> Self {
        conditions.iter().collect()
    }
}

impl JsonSchema for Conditions {
    fn schema_name() -> String {
        "Conditions".to_string()
    }

    fn json_schema(gen: &mut SchemaGenerator) -> Schema {
        <Vec<Condition>>::json_schema(gen)
    }
}
