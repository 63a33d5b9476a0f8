//! Shared fixtures and collection-level tests that don't fit neatly beside any
//! single module (`List`/`OrderedSet` are used throughout `fsm.rs`).

mod test_list;
mod test_ordered_set;
