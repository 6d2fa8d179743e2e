//! Sequence access methods: the page format shared by all of them, the
//! built-in local method with its WAL replay, dispatch through handler
//! routines and crash recovery.
#![deny(missing_docs)]

pub mod engine;
pub mod error;
pub mod local;
pub mod local_xlog;
pub mod recovery;
pub mod relation;
pub mod routine;
pub mod seqpage;

pub use engine::{Engine, EngineOptions, DEFAULT_SHARED_BUFFERS};
pub use error::{Result, SequenceError};
pub use relation::Relation;
pub use routine::{
    sequence_change_persistence, sequence_get_state, sequence_get_table_am, sequence_init,
    sequence_nextval, sequence_reset, sequence_setval, AmHandlerFn, NextvalParams, SequenceAm,
    SequenceAmRoutine,
};
