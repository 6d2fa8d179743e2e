//! Sequence access method interface and dispatch.
//!
//! A handler returns a [`SequenceAmRoutine`] listing its callbacks. The
//! routine is validated once into a [`SequenceAm`] where every callback is
//! present; the `sequence_*` wrappers dispatch through the access method
//! recorded for the relation.

use seqam_catalog::AccessMethodForm;
use seqam_storage::Persistence;

use crate::error::{Result, SequenceError};
use crate::relation::Relation;

/// Bounds and step for one `nextval` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextvalParams {
    /// INCREMENT, never zero.
    pub incby: i64,
    /// MAXVALUE.
    pub maxv: i64,
    /// MINVALUE.
    pub minv: i64,
    /// Values to reserve for the session; at least 1.
    pub cache: i64,
    /// Wrap around at the bounds.
    pub cycle: bool,
}

/// Name of the table access method describing the tuple layout.
pub type GetTableAmFn = fn() -> &'static str;
/// Initialize storage with `(last_value, is_called)`.
pub type InitFn = fn(&mut Relation<'_>, i64, bool) -> Result<()>;
/// Produce values: returns the value to hand out and the last value
/// reserved for the session cache.
pub type NextvalFn = fn(&mut Relation<'_>, &NextvalParams) -> Result<(i64, i64)>;
/// Set `(next, is_called)`.
pub type SetvalFn = fn(&mut Relation<'_>, i64, bool) -> Result<()>;
/// Restart at `(start, is_called)`, clearing the logged reservation when the
/// flag is set.
pub type ResetFn = fn(&mut Relation<'_>, i64, bool, bool) -> Result<()>;
/// Read `(last_value, is_called)`.
pub type GetStateFn = fn(&mut Relation<'_>) -> Result<(i64, bool)>;
/// Move the sequence to storage of another persistence.
pub type ChangePersistenceFn = fn(&mut Relation<'_>, Persistence) -> Result<()>;

/// Callback table returned by a handler. Absent entries make the handler
/// unusable.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceAmRoutine {
    /// Table access method of the tuple.
    pub get_table_am: Option<GetTableAmFn>,
    /// Storage initialization.
    pub init: Option<InitFn>,
    /// Value generation.
    pub nextval: Option<NextvalFn>,
    /// Explicit positioning.
    pub setval: Option<SetvalFn>,
    /// Restart.
    pub reset: Option<ResetFn>,
    /// State read.
    pub get_state: Option<GetStateFn>,
    /// Persistence change.
    pub change_persistence: Option<ChangePersistenceFn>,
}

/// Handler function: `None` models a handler that returned something other
/// than a routine.
pub type AmHandlerFn = fn() -> Option<SequenceAmRoutine>;

/// Validated routine of one access method.
#[derive(Debug, Clone)]
pub struct SequenceAm {
    /// Access method name.
    pub name: String,
    /// Handler name.
    pub handler: String,
    /// Table access method of the tuple.
    pub get_table_am: GetTableAmFn,
    /// Storage initialization.
    pub init: InitFn,
    /// Value generation.
    pub nextval: NextvalFn,
    /// Explicit positioning.
    pub setval: SetvalFn,
    /// Restart.
    pub reset: ResetFn,
    /// State read.
    pub get_state: GetStateFn,
    /// Persistence change.
    pub change_persistence: ChangePersistenceFn,
}

impl SequenceAm {
    /// Call `handler` and validate the routine it returns.
    pub fn from_handler(form: &AccessMethodForm, handler: AmHandlerFn) -> Result<Self> {
        let routine = handler().ok_or_else(|| {
            SequenceError::BadAccessMethodHandle(format!(
                "sequence access method handler {} did not return a SequenceAmRoutine struct",
                form.handler
            ))
        })?;
        let missing = |callback: &str| {
            SequenceError::BadAccessMethodHandle(format!(
                "sequence access method handler {} did not provide callback {}",
                form.handler, callback
            ))
        };
        Ok(Self {
            name: form.name.clone(),
            handler: form.handler.clone(),
            get_table_am: routine.get_table_am.ok_or_else(|| missing("get_table_am"))?,
            init: routine.init.ok_or_else(|| missing("init"))?,
            nextval: routine.nextval.ok_or_else(|| missing("nextval"))?,
            setval: routine.setval.ok_or_else(|| missing("setval"))?,
            reset: routine.reset.ok_or_else(|| missing("reset"))?,
            get_state: routine.get_state.ok_or_else(|| missing("get_state"))?,
            change_persistence: routine
                .change_persistence
                .ok_or_else(|| missing("change_persistence"))?,
        })
    }
}

/// Table access method describing the sequence tuple.
pub fn sequence_get_table_am(rel: &Relation<'_>) -> Result<&'static str> {
    let am = rel.sequence_am()?;
    Ok((am.get_table_am)())
}

/// Initialize freshly created storage.
pub fn sequence_init(rel: &mut Relation<'_>, last_value: i64, is_called: bool) -> Result<()> {
    let am = rel.sequence_am()?;
    (am.init)(rel, last_value, is_called)
}

/// Produce the next value(s).
pub fn sequence_nextval(rel: &mut Relation<'_>, params: &NextvalParams) -> Result<(i64, i64)> {
    let am = rel.sequence_am()?;
    (am.nextval)(rel, params)
}

/// Position the sequence.
pub fn sequence_setval(rel: &mut Relation<'_>, next: i64, is_called: bool) -> Result<()> {
    let am = rel.sequence_am()?;
    (am.setval)(rel, next, is_called)
}

/// Restart the sequence.
pub fn sequence_reset(
    rel: &mut Relation<'_>,
    startv: i64,
    is_called: bool,
    reset_state: bool,
) -> Result<()> {
    let am = rel.sequence_am()?;
    (am.reset)(rel, startv, is_called, reset_state)
}

/// Read `(last_value, is_called)`.
pub fn sequence_get_state(rel: &mut Relation<'_>) -> Result<(i64, bool)> {
    let am = rel.sequence_am()?;
    (am.get_state)(rel)
}

/// Move to storage of `persistence`.
pub fn sequence_change_persistence(rel: &mut Relation<'_>, persistence: Persistence) -> Result<()> {
    let am = rel.sequence_am()?;
    (am.change_persistence)(rel, persistence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqam_catalog::AmKind;

    fn form() -> AccessMethodForm {
        AccessMethodForm {
            oid: 9000,
            name: "broken".into(),
            kind: AmKind::Sequence,
            handler: "broken_handler".into(),
        }
    }

    fn table_am() -> &'static str {
        "heap"
    }

    #[test]
    fn handler_without_routine_is_rejected() {
        let err = SequenceAm::from_handler(&form(), || None).unwrap_err();
        assert_eq!(
            err.to_string(),
            "sequence access method handler broken_handler did not return a SequenceAmRoutine struct"
        );
    }

    #[test]
    fn every_callback_is_required() {
        let err = SequenceAm::from_handler(&form(), || {
            Some(SequenceAmRoutine {
                get_table_am: Some(table_am),
                ..SequenceAmRoutine::default()
            })
        })
        .unwrap_err();
        assert!(matches!(err, SequenceError::BadAccessMethodHandle(_)));
        assert!(err.to_string().ends_with("did not provide callback init"));
    }

    #[test]
    fn local_handler_is_complete() {
        let am = SequenceAm::from_handler(&form(), crate::local::handler).unwrap();
        assert_eq!((am.get_table_am)(), "heap");
    }
}
