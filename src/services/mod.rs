pub mod admission_oracle;
pub mod icon_cache;
pub mod session_reporter;

pub use admission_oracle::AdmissionOracle;
pub use icon_cache::{CachedIcon, IconCache};
pub use session_reporter::SessionReporter;
