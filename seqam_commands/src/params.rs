//! Option processing for CREATE and ALTER SEQUENCE.
//!
//! Options are applied to a copy of the `pg_sequence` row; nothing is
//! written until every check has passed.

use serde::{Deserialize, Serialize};

use seqam_access::{Result, SequenceError};
use seqam_catalog::{SeqType, SequenceForm};

/// One option of CREATE or ALTER SEQUENCE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeqOption {
    /// `AS type`.
    As(String),
    /// `INCREMENT BY n`.
    Increment(i64),
    /// `START WITH n`.
    Start(i64),
    /// `RESTART [WITH n]`; without a value the start value is used.
    Restart(Option<i64>),
    /// `MAXVALUE n`, or `NO MAXVALUE` as `None`.
    MaxValue(Option<i64>),
    /// `MINVALUE n`, or `NO MINVALUE` as `None`.
    MinValue(Option<i64>),
    /// `CACHE n`.
    Cache(i64),
    /// `[NO] CYCLE`.
    Cycle(bool),
    /// `OWNED BY [schema.]table.column` or `OWNED BY NONE`, as name parts.
    OwnedBy(Vec<String>),
    /// `SEQUENCE NAME`, only meaningful for identity columns.
    SequenceName(Vec<String>),
}

/// Tuple state installed when the sequence storage is rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqRestart {
    /// Value stored as `last_value`.
    pub last_value: i64,
    /// Whether `last_value` was already handed out.
    pub is_called: bool,
    /// Whether access method state beyond the value must be reset.
    pub reset_state: bool,
}

/// What remains to do once options were applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamOutcome {
    /// Storage must be rewritten to apply the change.
    pub need_seq_rewrite: bool,
    /// `OWNED BY` target, if given.
    pub owned_by: Option<Vec<String>>,
}

fn take<T>(slot: &mut Option<T>, value: T) -> Result<()> {
    if slot.is_some() {
        return Err(SequenceError::SyntaxError(
            "conflicting or redundant options".into(),
        ));
    }
    *slot = Some(value);
    Ok(())
}

fn invalid(msg: String) -> SequenceError {
    SequenceError::InvalidParameter(msg)
}

/// Apply `options` to `form` and `state`.
///
/// With `is_init` unspecified options get their defaults; otherwise only the
/// given options change. Every option except `OWNED BY` requests a rewrite.
pub fn init_params(
    options: &[SeqOption],
    for_identity: bool,
    is_init: bool,
    form: &mut SequenceForm,
    state: &mut SeqRestart,
) -> Result<ParamOutcome> {
    let mut as_type: Option<&str> = None;
    let mut increment_by: Option<i64> = None;
    let mut start_value: Option<i64> = None;
    let mut restart_value: Option<Option<i64>> = None;
    let mut max_value: Option<Option<i64>> = None;
    let mut min_value: Option<Option<i64>> = None;
    let mut cache_value: Option<i64> = None;
    let mut is_cycled: Option<bool> = None;
    let mut outcome = ParamOutcome::default();

    for option in options {
        match option {
            SeqOption::As(name) => take(&mut as_type, name.as_str())?,
            SeqOption::Increment(v) => take(&mut increment_by, *v)?,
            SeqOption::Start(v) => take(&mut start_value, *v)?,
            SeqOption::Restart(v) => take(&mut restart_value, *v)?,
            SeqOption::MaxValue(v) => take(&mut max_value, *v)?,
            SeqOption::MinValue(v) => take(&mut min_value, *v)?,
            SeqOption::Cache(v) => take(&mut cache_value, *v)?,
            SeqOption::Cycle(v) => take(&mut is_cycled, *v)?,
            SeqOption::OwnedBy(names) => take(&mut outcome.owned_by, names.clone())?,
            SeqOption::SequenceName(_) => {
                return Err(SequenceError::SyntaxError(
                    "invalid sequence option SEQUENCE NAME".into(),
                ))
            }
        }
        if !matches!(option, SeqOption::OwnedBy(_)) {
            outcome.need_seq_rewrite = true;
        }
    }

    if is_init {
        state.reset_state = true;
    }

    let mut reset_max_value = false;
    let mut reset_min_value = false;
    if let Some(name) = as_type {
        let new_type = SeqType::from_name(name).ok_or_else(|| {
            invalid(if for_identity {
                "identity column type must be smallint, integer, or bigint".into()
            } else {
                "sequence type must be smallint, integer, or bigint".into()
            })
        })?;
        if !is_init {
            // Bounds that sat at the old type's extremes follow the new type.
            reset_max_value = form.max == form.seq_type.max();
            reset_min_value = form.min == form.seq_type.min();
        }
        form.seq_type = new_type;
    } else if is_init {
        form.seq_type = SeqType::Int8;
    }

    if let Some(v) = increment_by {
        form.increment = v;
        if v == 0 {
            return Err(invalid("INCREMENT must not be zero".into()));
        }
        state.reset_state = true;
    } else if is_init {
        form.increment = 1;
    }

    if let Some(v) = is_cycled {
        form.cycle = v;
        state.reset_state = true;
    } else if is_init {
        form.cycle = false;
    }

    match max_value {
        Some(Some(v)) => {
            form.max = v;
            state.reset_state = true;
        }
        _ if is_init || max_value.is_some() || reset_max_value => {
            form.max = if form.increment > 0 || reset_max_value {
                form.seq_type.max()
            } else {
                -1
            };
            state.reset_state = true;
        }
        _ => {}
    }
    if form.max < form.seq_type.min() || form.max > form.seq_type.max() {
        return Err(invalid(format!(
            "MAXVALUE ({}) is out of range for sequence data type {}",
            form.max,
            form.seq_type.name()
        )));
    }

    match min_value {
        Some(Some(v)) => {
            form.min = v;
            state.reset_state = true;
        }
        _ if is_init || min_value.is_some() || reset_min_value => {
            form.min = if form.increment < 0 || reset_min_value {
                form.seq_type.min()
            } else {
                1
            };
            state.reset_state = true;
        }
        _ => {}
    }
    if form.min < form.seq_type.min() || form.min > form.seq_type.max() {
        return Err(invalid(format!(
            "MINVALUE ({}) is out of range for sequence data type {}",
            form.min,
            form.seq_type.name()
        )));
    }

    if form.min >= form.max {
        return Err(invalid(format!(
            "MINVALUE ({}) must be less than MAXVALUE ({})",
            form.min, form.max
        )));
    }

    if let Some(v) = start_value {
        form.start = v;
    } else if is_init {
        form.start = if form.increment > 0 { form.min } else { form.max };
    }
    if form.start < form.min {
        return Err(invalid(format!(
            "START value ({}) cannot be less than MINVALUE ({})",
            form.start, form.min
        )));
    }
    if form.start > form.max {
        return Err(invalid(format!(
            "START value ({}) cannot be greater than MAXVALUE ({})",
            form.start, form.max
        )));
    }

    if let Some(restart) = restart_value {
        state.last_value = restart.unwrap_or(form.start);
        state.is_called = false;
        state.reset_state = true;
    } else if is_init {
        state.last_value = form.start;
        state.is_called = false;
    }
    // Also catches a current value left outside new MINVALUE/MAXVALUE.
    if state.last_value < form.min {
        return Err(invalid(format!(
            "RESTART value ({}) cannot be less than MINVALUE ({})",
            state.last_value, form.min
        )));
    }
    if state.last_value > form.max {
        return Err(invalid(format!(
            "RESTART value ({}) cannot be greater than MAXVALUE ({})",
            state.last_value, form.max
        )));
    }

    if let Some(v) = cache_value {
        form.cache = v;
        if v <= 0 {
            return Err(invalid(format!("CACHE ({v}) must be greater than zero")));
        }
        state.reset_state = true;
    } else if is_init {
        form.cache = 1;
    }

    Ok(outcome)
}

/// Parameters of `form` as the option list that would recreate them.
pub fn sequence_options(form: &SequenceForm) -> Vec<SeqOption> {
    vec![
        SeqOption::Cache(form.cache),
        SeqOption::Cycle(form.cycle),
        SeqOption::Increment(form.increment),
        SeqOption::MaxValue(Some(form.max)),
        SeqOption::MinValue(Some(form.min)),
        SeqOption::Start(form.start),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank() -> (SequenceForm, SeqRestart) {
        (
            SequenceForm {
                relid: 0,
                seq_type: SeqType::Int8,
                start: 0,
                increment: 0,
                max: 0,
                min: 0,
                cache: 0,
                cycle: false,
            },
            SeqRestart {
                last_value: 0,
                is_called: false,
                reset_state: false,
            },
        )
    }

    fn create(options: &[SeqOption]) -> Result<(SequenceForm, SeqRestart)> {
        let (mut form, mut state) = blank();
        init_params(options, false, true, &mut form, &mut state)?;
        Ok((form, state))
    }

    fn message(err: SequenceError) -> String {
        err.to_string()
    }

    #[test]
    fn ascending_defaults() {
        let (form, state) = create(&[]).unwrap();
        assert_eq!(form.seq_type, SeqType::Int8);
        assert_eq!((form.min, form.max, form.start), (1, i64::MAX, 1));
        assert_eq!((form.increment, form.cache, form.cycle), (1, 1, false));
        assert_eq!((state.last_value, state.is_called, state.reset_state), (1, false, true));
    }

    #[test]
    fn descending_defaults() {
        let (form, state) = create(&[SeqOption::Increment(-2), SeqOption::As("int2".into())]).unwrap();
        assert_eq!((form.min, form.max, form.start), (i16::MIN as i64, -1, -1));
        assert_eq!(state.last_value, -1);
    }

    #[test]
    fn alter_changes_only_given_options() {
        let (mut form, mut state) = create(&[SeqOption::MaxValue(Some(100))]).unwrap();
        state.reset_state = false;
        let outcome = init_params(&[SeqOption::Cache(10)], false, false, &mut form, &mut state).unwrap();
        assert!(outcome.need_seq_rewrite);
        assert_eq!((form.max, form.cache), (100, 10));
        assert!(state.reset_state);
    }

    #[test]
    fn type_change_moves_extreme_bounds() {
        let (mut form, mut state) = create(&[SeqOption::As("integer".into())]).unwrap();
        assert_eq!(form.max, i32::MAX as i64);
        init_params(&[SeqOption::As("bigint".into())], false, false, &mut form, &mut state).unwrap();
        assert_eq!(form.max, i64::MAX);
        assert_eq!(form.min, 1);

        let (mut form, mut state) =
            create(&[SeqOption::As("int4".into()), SeqOption::MaxValue(Some(500))]).unwrap();
        init_params(&[SeqOption::As("int8".into())], false, false, &mut form, &mut state).unwrap();
        assert_eq!(form.max, 500);
    }

    #[test]
    fn no_maxvalue_restores_the_default() {
        let (mut form, mut state) = create(&[SeqOption::MaxValue(Some(10))]).unwrap();
        init_params(&[SeqOption::MaxValue(None)], false, false, &mut form, &mut state).unwrap();
        assert_eq!(form.max, i64::MAX);
    }

    #[test]
    fn owned_by_alone_does_not_rewrite() {
        let (mut form, mut state) = create(&[]).unwrap();
        let target = vec!["t".to_string(), "id".to_string()];
        let outcome =
            init_params(&[SeqOption::OwnedBy(target.clone())], false, false, &mut form, &mut state)
                .unwrap();
        assert!(!outcome.need_seq_rewrite);
        assert_eq!(outcome.owned_by, Some(target));
    }

    #[test]
    fn restart_defaults_to_start() {
        let (mut form, mut state) = create(&[SeqOption::Start(5)]).unwrap();
        state.last_value = 40;
        state.is_called = true;
        init_params(&[SeqOption::Restart(None)], false, false, &mut form, &mut state).unwrap();
        assert_eq!((state.last_value, state.is_called), (5, false));
    }

    #[test]
    fn rejected_options() {
        let cases: Vec<(Vec<SeqOption>, &str)> = vec![
            (vec![SeqOption::Increment(0)], "INCREMENT must not be zero"),
            (
                vec![SeqOption::As("numeric".into())],
                "sequence type must be smallint, integer, or bigint",
            ),
            (
                vec![SeqOption::As("smallint".into()), SeqOption::MaxValue(Some(40000))],
                "MAXVALUE (40000) is out of range for sequence data type smallint",
            ),
            (
                vec![SeqOption::MinValue(Some(5)), SeqOption::MaxValue(Some(5))],
                "MINVALUE (5) must be less than MAXVALUE (5)",
            ),
            (
                vec![SeqOption::Start(0)],
                "START value (0) cannot be less than MINVALUE (1)",
            ),
            (
                vec![SeqOption::MaxValue(Some(3)), SeqOption::Restart(Some(4))],
                "RESTART value (4) cannot be greater than MAXVALUE (3)",
            ),
            (vec![SeqOption::Cache(0)], "CACHE (0) must be greater than zero"),
            (
                vec![SeqOption::Cache(2), SeqOption::Cache(3)],
                "conflicting or redundant options",
            ),
            (
                vec![SeqOption::SequenceName(vec!["s".into()])],
                "invalid sequence option SEQUENCE NAME",
            ),
        ];
        for (options, expected) in cases {
            assert_eq!(message(create(&options).unwrap_err()), expected, "{options:?}");
        }
    }

    #[test]
    fn identity_type_message() {
        let (mut form, mut state) = blank();
        let err = init_params(&[SeqOption::As("text".into())], true, true, &mut form, &mut state)
            .unwrap_err();
        assert_eq!(err.to_string(), "identity column type must be smallint, integer, or bigint");
    }

    #[test]
    fn options_describe_the_form() {
        let (form, _) = create(&[SeqOption::Cache(20), SeqOption::Cycle(true)]).unwrap();
        let options = sequence_options(&form);
        assert!(options.contains(&SeqOption::Cache(20)));
        assert!(options.contains(&SeqOption::Cycle(true)));
        assert!(options.contains(&SeqOption::Start(1)));
    }
}
