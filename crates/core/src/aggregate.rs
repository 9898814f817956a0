//! Aggregate root trait.

/// Aggregate root marker + minimal interface.
///
/// Kept small on purpose: the consulta document decides how it models its own
/// state transitions, this only exposes identity and the mutation counter that
/// observers use to order snapshots.
pub trait AggregateRoot {
    /// Strongly-typed aggregate identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the aggregate identifier.
    fn id(&self) -> &Self::Id;

    /// Monotonically increasing version of the aggregate's state.
    ///
    /// Incremented once per persisted mutation.
    fn version(&self) -> u64;
}
