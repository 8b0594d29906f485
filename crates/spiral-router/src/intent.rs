//! Intent types and builder.
//!
//! An Intent is a request to have a decision made: either join a pending
//! primitive whose context matches, or open a new one.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use spiral_core::{AgentId, Context, ContextValue, OptionId, Result, SpiralError, TreeConfig};
use uuid::Uuid;

/// A request routed to a choice primitive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    /// Unique identifier for this intent.
    pub id: Uuid,

    /// The agent or producer that submitted the intent.
    pub requester: AgentId,

    /// Options for a primitive created on this intent's behalf.
    pub options: Vec<OptionId>,

    /// Context describing the decision.
    pub context: Context,

    /// Context keys a pending primitive must match on.
    pub match_keys: Vec<String>,

    /// Option the requester proposes, if any.
    pub proposal: Option<OptionId>,

    /// How long the routed primitive may stay unresolved.
    #[serde(default, with = "duration_ms")]
    pub deadline: Option<Duration>,

    /// Option applied when the deadline expires.
    pub default_option: Option<OptionId>,

    /// Configuration for a tree created on this intent's behalf.
    #[serde(default)]
    pub tree_config: TreeConfig,

    /// Timestamp when the intent was created.
    pub created_at: DateTime<Utc>,
}

/// Builder for creating Intents with a fluent API.
#[derive(Debug, Default)]
pub struct IntentBuilder {
    requester: Option<AgentId>,
    options: Vec<OptionId>,
    context: Context,
    match_keys: Vec<String>,
    proposal: Option<OptionId>,
    deadline: Option<Duration>,
    default_option: Option<OptionId>,
    tree_config: TreeConfig,
}

impl IntentBuilder {
    /// Create a new IntentBuilder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the requester.
    pub fn requester(mut self, requester: impl Into<AgentId>) -> Self {
        self.requester = Some(requester.into());
        self
    }

    /// Add an option.
    pub fn option(mut self, option: impl Into<OptionId>) -> Self {
        self.options.push(option.into());
        self
    }

    /// Add several options.
    pub fn options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OptionId>,
    {
        self.options.extend(options.into_iter().map(Into::into));
        self
    }

    /// Add a context entry.
    pub fn context(mut self, key: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Add a context entry that pending primitives must match on.
    pub fn match_on(mut self, key: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        let key = key.into();
        self.context.insert(key.clone(), value.into());
        self.match_keys.push(key);
        self
    }

    /// Propose an option.
    pub fn propose(mut self, option: impl Into<OptionId>) -> Self {
        self.proposal = Some(option.into());
        self
    }

    /// Set the deadline.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the option applied at deadline expiry.
    pub fn default_option(mut self, option: impl Into<OptionId>) -> Self {
        self.default_option = Some(option.into());
        self
    }

    /// Set the configuration of a newly created tree.
    pub fn tree_config(mut self, config: TreeConfig) -> Self {
        self.tree_config = config;
        self
    }

    /// Build the Intent.
    pub fn build(self) -> Result<Intent> {
        let id = Uuid::new_v4();
        let invalid = |message: String| SpiralError::IntentInvalid {
            intent_id: Some(id),
            message,
        };

        let requester = self
            .requester
            .filter(|r| !r.trim().is_empty())
            .ok_or_else(|| invalid("Intent requester is required".to_string()))?;

        if !self.options.is_empty() {
            spiral_core::primitive::validate_options(&self.options)?;

            for option in self.proposal.iter().chain(self.default_option.iter()) {
                if !self.options.contains(option) {
                    return Err(invalid(format!("Option '{}' is not among the intent's options", option)));
                }
            }
        }

        if let Some(deadline) = self.deadline {
            if deadline <= Duration::zero() {
                return Err(invalid("Deadline must be positive".to_string()));
            }
        }

        Ok(Intent {
            id,
            requester,
            options: self.options,
            context: self.context,
            match_keys: self.match_keys,
            proposal: self.proposal,
            deadline: self.deadline,
            default_option: self.default_option,
            tree_config: self.tree_config,
            created_at: Utc::now(),
        })
    }
}

impl Intent {
    /// Create a new IntentBuilder.
    pub fn builder() -> IntentBuilder {
        IntentBuilder::new()
    }
}

mod duration_ms {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.num_milliseconds()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<i64>::deserialize(d)?.map(Duration::milliseconds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_builder() {
        let intent = Intent::builder()
            .requester("ui")
            .options(["A", "B", "C"])
            .match_on("domain", "storage")
            .context("user", "ana")
            .propose("B")
            .deadline(Duration::seconds(5))
            .default_option("A")
            .build()
            .unwrap();

        assert_eq!(intent.options.len(), 3);
        assert_eq!(intent.match_keys, vec!["domain".to_string()]);
        assert_eq!(intent.context.len(), 2);
        assert_eq!(intent.proposal.as_deref(), Some("B"));
    }

    #[test]
    fn test_missing_requester() {
        let result = Intent::builder().option("A").build();
        assert!(matches!(result, Err(SpiralError::IntentInvalid { .. })));
    }

    #[test]
    fn test_proposal_must_be_offered() {
        let result = Intent::builder()
            .requester("ui")
            .options(["A", "B"])
            .propose("Z")
            .build();
        assert!(matches!(result, Err(SpiralError::IntentInvalid { .. })));
    }

    #[test]
    fn test_duplicate_options_rejected() {
        let result = Intent::builder().requester("ui").options(["A", "A"]).build();
        assert!(matches!(result, Err(SpiralError::DuplicateOption { .. })));
    }

    #[test]
    fn test_deadline_serialization() {
        let intent = Intent::builder()
            .requester("ui")
            .option("A")
            .deadline(Duration::milliseconds(1500))
            .build()
            .unwrap();

        let json = serde_json::to_value(&intent).unwrap();
        assert_eq!(json["deadline"], 1500);

        let back: Intent = serde_json::from_value(json).unwrap();
        assert_eq!(back.deadline, Some(Duration::milliseconds(1500)));
    }
}
