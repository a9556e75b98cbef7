//! PRD session domain model
//!
//! One [`PrdSession`] exists per chat. It tracks the deterministic interview
//! stage, the narrative context fields, the story list, and the cached result
//! of the last external clarity assessment.

mod lock;
mod store;

pub use lock::{LOCK_POLL_INTERVAL, LOCK_STALE_AGE, LOCK_WAIT_DEADLINE, StoreLock};
pub use store::{STORE_FILE, SessionStore};

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Marker prefix recorded when the user explicitly skips a field
pub const ASSUMED_PREFIX: &str = "[assumed]";

/// The four supported agent roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Manager,
    Planner,
    Developer,
    Qa,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Manager => "manager",
            Role::Planner => "planner",
            Role::Developer => "developer",
            Role::Qa => "qa",
        }
    }

    /// Fixed default story priority for this role
    pub fn default_priority(&self) -> u32 {
        match self {
            Role::Manager => 900,
            Role::Planner => 950,
            Role::Developer => 1000,
            Role::Qa => 1100,
        }
    }

    pub fn all() -> [Role; 4] {
        [Role::Manager, Role::Planner, Role::Developer, Role::Qa]
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    /// Accepts role names and the legacy numeric aliases 1-4
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "manager" | "1" => Ok(Role::Manager),
            "planner" | "2" => Ok(Role::Planner),
            "developer" | "dev" | "3" => Ok(Role::Developer),
            "qa" | "4" => Ok(Role::Qa),
            _ => Err(format!(
                "Invalid role: '{}'. Expected 'manager', 'planner', 'developer' or 'qa'",
                s
            )),
        }
    }
}

/// Interview stages - a closed set
///
/// Serialized as the snake_case strings below. Unknown strings found on disk
/// deserialize to [`Stage::AwaitProduct`]; the stage machine re-derives the
/// right stage from session content before dispatching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    AwaitProduct,
    AwaitProblem,
    AwaitGoal,
    AwaitInScope,
    AwaitOutOfScope,
    AwaitAcceptance,
    AwaitConstraints,
    AwaitStoryTitle,
    AwaitStoryDesc,
    AwaitStoryRole,
    AwaitStoryPriority,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::AwaitProduct => "await_product",
            Stage::AwaitProblem => "await_problem",
            Stage::AwaitGoal => "await_goal",
            Stage::AwaitInScope => "await_in_scope",
            Stage::AwaitOutOfScope => "await_out_of_scope",
            Stage::AwaitAcceptance => "await_acceptance",
            Stage::AwaitConstraints => "await_constraints",
            Stage::AwaitStoryTitle => "await_story_title",
            Stage::AwaitStoryDesc => "await_story_desc",
            Stage::AwaitStoryRole => "await_story_role",
            Stage::AwaitStoryPriority => "await_story_priority",
        }
    }

    /// Parse a stage string; `None` for anything outside the fixed set
    pub fn parse(s: &str) -> Option<Stage> {
        match s.trim() {
            "await_product" => Some(Stage::AwaitProduct),
            "await_problem" => Some(Stage::AwaitProblem),
            "await_goal" => Some(Stage::AwaitGoal),
            "await_in_scope" => Some(Stage::AwaitInScope),
            "await_out_of_scope" => Some(Stage::AwaitOutOfScope),
            "await_acceptance" => Some(Stage::AwaitAcceptance),
            "await_constraints" => Some(Stage::AwaitConstraints),
            "await_story_title" => Some(Stage::AwaitStoryTitle),
            "await_story_desc" => Some(Stage::AwaitStoryDesc),
            "await_story_role" => Some(Stage::AwaitStoryRole),
            "await_story_priority" => Some(Stage::AwaitStoryPriority),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for Stage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Stage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Stage::parse(&s).unwrap_or(Stage::AwaitProduct))
    }
}

/// The six narrative context fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextField {
    Problem,
    Goal,
    InScope,
    OutOfScope,
    Acceptance,
    Constraints,
}

impl ContextField {
    pub fn key(&self) -> &'static str {
        match self {
            ContextField::Problem => "problem",
            ContextField::Goal => "goal",
            ContextField::InScope => "in_scope",
            ContextField::OutOfScope => "out_of_scope",
            ContextField::Acceptance => "acceptance",
            ContextField::Constraints => "constraints",
        }
    }

    /// The stage that asks for this field
    pub fn stage(&self) -> Stage {
        match self {
            ContextField::Problem => Stage::AwaitProblem,
            ContextField::Goal => Stage::AwaitGoal,
            ContextField::InScope => Stage::AwaitInScope,
            ContextField::OutOfScope => Stage::AwaitOutOfScope,
            ContextField::Acceptance => Stage::AwaitAcceptance,
            ContextField::Constraints => Stage::AwaitConstraints,
        }
    }

    /// Canned placeholder recorded when the user skips this field
    pub fn canned_default(&self) -> &'static str {
        match self {
            ContextField::Problem => "problem statement to be refined with stakeholders",
            ContextField::Goal => "success criteria to be defined",
            ContextField::InScope => "core user-facing flow",
            ContextField::OutOfScope => "integrations beyond the core flow",
            ContextField::Acceptance => "happy path works end to end",
            ContextField::Constraints => "no special constraints identified",
        }
    }

    /// Prompt shown when this field's stage is active
    pub fn prompt(&self) -> &'static str {
        match self {
            ContextField::Problem => "What problem does this product solve?",
            ContextField::Goal => "What is the goal? How do you measure success?",
            ContextField::InScope => "What is in scope for the first version?",
            ContextField::OutOfScope => "What is explicitly out of scope?",
            ContextField::Acceptance => "What are the acceptance criteria?",
            ContextField::Constraints => "Any constraints (tech, deadline, compliance)? Reply 'skip' if none.",
        }
    }

    pub fn all() -> [ContextField; 6] {
        [
            ContextField::Problem,
            ContextField::Goal,
            ContextField::InScope,
            ContextField::OutOfScope,
            ContextField::Acceptance,
            ContextField::Constraints,
        ]
    }

    /// The five fields required for readiness (constraints is optional)
    pub fn required() -> [ContextField; 5] {
        [
            ContextField::Problem,
            ContextField::Goal,
            ContextField::InScope,
            ContextField::OutOfScope,
            ContextField::Acceptance,
        ]
    }
}

/// Narrative context of a session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionContext {
    #[serde(default)]
    pub problem: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub in_scope: String,
    #[serde(default)]
    pub out_of_scope: String,
    #[serde(default)]
    pub acceptance: String,
    #[serde(default)]
    pub constraints: String,
}

impl SessionContext {
    pub fn get(&self, field: ContextField) -> &str {
        match field {
            ContextField::Problem => &self.problem,
            ContextField::Goal => &self.goal,
            ContextField::InScope => &self.in_scope,
            ContextField::OutOfScope => &self.out_of_scope,
            ContextField::Acceptance => &self.acceptance,
            ContextField::Constraints => &self.constraints,
        }
    }

    fn set(&mut self, field: ContextField, value: String) {
        match field {
            ContextField::Problem => self.problem = value,
            ContextField::Goal => self.goal = value,
            ContextField::InScope => self.in_scope = value,
            ContextField::OutOfScope => self.out_of_scope = value,
            ContextField::Acceptance => self.acceptance = value,
            ContextField::Constraints => self.constraints = value,
        }
    }
}

/// One requirement item destined for the issue queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrdStory {
    pub id: String,
    pub title: String,
    pub description: String,
    pub role: Role,
    pub priority: u32,
}

/// One chat's in-progress requirements-gathering state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrdSession {
    pub chat_id: i64,
    pub stage: Stage,
    #[serde(default)]
    pub product_name: String,
    #[serde(default)]
    pub context: SessionContext,
    /// `field: value` entries, one per assumed placeholder, deduplicated
    #[serde(default)]
    pub assumptions: Vec<String>,
    /// Per-role priority overrides, seeded with the fixed role defaults
    #[serde(default = "default_agent_priority")]
    pub agent_priority: BTreeMap<Role, u32>,
    #[serde(default)]
    pub stories: Vec<PrdStory>,

    // Scratch space for a story under construction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_desc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_role: Option<Role>,

    // Cached result of the last external clarity assessment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codex_score: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codex_ready: Option<bool>,
    #[serde(default)]
    pub codex_missing: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codex_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codex_scored_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

/// Fixed role defaults: manager=900, planner=950, developer=1000, qa=1100
pub fn default_agent_priority() -> BTreeMap<Role, u32> {
    Role::all().iter().map(|r| (*r, r.default_priority())).collect()
}

/// True when a stored value is an `[assumed]` placeholder
pub fn is_assumed(value: &str) -> bool {
    value.trim_start().starts_with(ASSUMED_PREFIX)
}

/// True for inputs that mean "skip this field, assume a default"
pub fn is_skip_word(input: &str) -> bool {
    matches!(input.trim().to_lowercase().as_str(), "skip" | "default" | "n/a" | "na")
}

impl PrdSession {
    /// Create a fresh session at the first stage
    pub fn new(chat_id: i64) -> Self {
        let now = Utc::now();
        Self {
            chat_id,
            stage: Stage::AwaitProduct,
            product_name: String::new(),
            context: SessionContext::default(),
            assumptions: Vec::new(),
            agent_priority: default_agent_priority(),
            stories: Vec::new(),
            draft_title: None,
            draft_desc: None,
            draft_role: None,
            codex_score: None,
            codex_ready: None,
            codex_missing: Vec::new(),
            codex_summary: None,
            codex_scored_at: None,
            created_at: now,
            last_updated_at: now,
        }
    }

    /// Update the mutation timestamp
    pub fn touch(&mut self) {
        self.last_updated_at = Utc::now();
    }

    /// Assign a context field, normalizing explicit skips into `[assumed]`
    /// placeholders and recording the assumption once.
    ///
    /// Returns true when the stored value changed.
    pub fn set_context_field(&mut self, field: ContextField, raw: &str) -> bool {
        let value = if is_skip_word(raw) {
            let assumed = format!("{} {}", ASSUMED_PREFIX, field.canned_default());
            let entry = format!("{}: {}", field.key(), field.canned_default());
            if !self.assumptions.contains(&entry) {
                self.assumptions.push(entry);
            }
            assumed
        } else {
            raw.trim().to_string()
        };

        if self.context.get(field) == value {
            return false;
        }
        self.context.set(field, value);
        self.touch();
        true
    }

    /// Id for the next story: session creation stamp + 1-based sequence
    pub fn next_story_id(&self) -> String {
        format!("prd-{}-{:03}", self.created_at.format("%Y%m%d%H%M%S"), self.stories.len() + 1)
    }

    /// Append a story and clear the draft scratch space; returns the new id
    pub fn push_story(&mut self, title: String, description: String, role: Role, priority: u32) -> String {
        let id = self.next_story_id();
        self.stories.push(PrdStory {
            id: id.clone(),
            title,
            description,
            role,
            priority,
        });
        self.draft_title = None;
        self.draft_desc = None;
        self.draft_role = None;
        self.touch();
        id
    }

    /// Priority for a role: session override, falling back to the fixed default
    pub fn role_priority(&self, role: Role) -> u32 {
        self.agent_priority.get(&role).copied().unwrap_or(role.default_priority())
    }
}
