//! redb table definitions for the batchgrid state store.
//!
//! Record tables use `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Job keys are zero-padded ids so iteration follows submission order.

use redb::TableDefinition;

/// Jobs keyed by `{id:020}`.
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Cluster records keyed by cluster name.
pub const CLUSTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("clusters");

/// Counters keyed by name.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Key in [`META`] holding the last issued job id.
pub const JOB_ID_SEQ: &str = "job_id_seq";
