//! Command layer over sequence access methods: the per-session value cache
//! behind `nextval`, `currval`, `lastval` and `setval`, and the statements
//! that create, alter, reset and drop sequences.
#![deny(missing_docs)]

pub mod ddl;
pub mod params;
pub mod session;

pub use ddl::{sequence_options, AlterSeqStmt, CreateSeqStmt};
pub use params::{init_params, ParamOutcome, SeqOption, SeqRestart};
pub use session::{SeqTableEntry, Session};
