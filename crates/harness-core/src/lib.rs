//! Parameter model, value normalization and error kinds shared by the
//! harness crates.

pub mod error;
pub mod fsutil;
pub mod layout;
pub mod params;
pub mod value;
pub mod wildcard;

pub use error::{HarnessError, ModelExecutionError, Result, TerminationRequested};
pub use fsutil::{atomic_write_bytes, atomic_write_json_pretty, ensure_dir, sha256_bytes, sha256_file};
pub use params::Parameters;
pub use value::{normalize_numeric, ForeignNumber, Value};
pub use wildcard::WildcardContext;
