//! Snowflake sequence access method: values combine a millisecond clock, a
//! configured machine id and a per-millisecond counter, so they stay unique
//! across machines without WAL-logging every increment.
#![deny(missing_docs)]

pub mod am;
pub mod id;

use tracing::info;

use seqam_access::{Engine, Result};
use seqam_config::{ConfigError, GucContext};
use seqam_storage::Oid;

pub use am::{SnowflakeData, SNOWFLAKE_MAGIC};
pub use id::{snowflake_get, SnowflakeId};

/// Access method name used in `USING`.
pub const SNOWFLAKE_AM_NAME: &str = "snowflake";
/// Handler name recorded in the access method row.
pub const SNOWFLAKE_HANDLER: &str = "snowflake_sequenceam_handler";
/// Setting holding the machine id.
pub const MACHINE_ID_SETTING: &str = "snowflake.machine_id";

/// Load the extension into `engine`: define `snowflake.machine_id` and
/// create the access method. Loading twice is harmless.
pub fn register(engine: &Engine) -> Result<Oid> {
    match engine.settings().define_custom_int(
        MACHINE_ID_SETTING,
        "Machine ID to use with snowflake sequence.",
        1,
        0,
        1023,
        GucContext::Superuser,
    ) {
        Ok(_) | Err(ConfigError::Redefined(_)) => {}
        Err(e) => return Err(e.into()),
    }
    let oid = engine.register_sequence_am(SNOWFLAKE_AM_NAME, SNOWFLAKE_HANDLER, am::handler)?;
    info!(oid, "snowflake extension loaded");
    Ok(oid)
}
