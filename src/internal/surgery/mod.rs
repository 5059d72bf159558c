//! The surgical operator algebra. Every operator checks its
//! preconditions before mutating, funnels sequence-shape changes
//! through the repository's mutation hook, and re-establishes the
//! graph invariants (derived children, mark uniqueness, cache
//! invalidation) before returning.

pub mod expunge;
pub mod merge;
pub mod split;
pub mod squash;

pub use squash::SquashPolicy;

use crate::errors::Result;
use crate::internal::repo::Repository;

impl Repository {
    /// Topologically prune commits that carry no interesting shape or
    /// content, keeping boring neighbors of interesting commits so the
    /// visible graph outline survives. Returns the number removed.
    pub fn reduce(&mut self) -> Result<usize> {
        let drop = self.reduce_selection()?;
        let removed = drop.len();
        if !drop.is_empty() {
            self.squash(&drop, SquashPolicy::deletion())?;
        }
        Ok(removed)
    }
}
