//! World store - the authoritative owner of all entity records
//!
//! Other components hold keys, never entity references. Mutations arrive as
//! change sets produced by the rule engine and apply transactionally:
//! every referenced key is validated against live state before anything is
//! touched, so a bad reference rejects the whole set.

mod store;
mod substitute;

pub use store::{
    AppliedChanges, Change, ChangeSet, StateView, WorldError, WorldState, WorldStore,
};
pub use substitute::substitute;
