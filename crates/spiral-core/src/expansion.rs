//! Spiral expansion: the caller-supplied function deriving child option sets.

use crate::context::Context;
use crate::types::OptionId;

/// Derives the option sets of the children spawned by a selection.
///
/// Invoked synchronously while the selection is applied. Implementations must
/// be free of side effects from the kernel's point of view: undo never replays
/// or reverses anything an expansion triggered.
pub trait Expansion: Send + Sync {
    /// Return one option set per child to spawn.
    fn expand(&self, selected: &str, context: &Context) -> Vec<Vec<OptionId>>;
}

impl<F> Expansion for F
where
    F: Fn(&str, &Context) -> Vec<Vec<OptionId>> + Send + Sync,
{
    fn expand(&self, selected: &str, context: &Context) -> Vec<Vec<OptionId>> {
        self(selected, context)
    }
}

/// Expansion that never spawns children.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExpansion;

impl Expansion for NoExpansion {
    fn expand(&self, _selected: &str, _context: &Context) -> Vec<Vec<OptionId>> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_expansion() {
        let expansion = |selected: &str, _ctx: &Context| {
            vec![vec![format!("{}:1", selected), format!("{}:2", selected)]]
        };
        let children = expansion.expand("Plan", &Context::new());
        assert_eq!(children, vec![vec!["Plan:1".to_string(), "Plan:2".to_string()]]);
    }

    #[test]
    fn test_no_expansion() {
        assert!(NoExpansion.expand("A", &Context::new()).is_empty());
    }
}
