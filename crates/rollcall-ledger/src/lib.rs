pub mod clock;
pub mod report;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use report::{export_csv, ReportRow, CSV_HEADER};
pub use store::{Ledger, LedgerConfig, LedgerError, DEFAULT_COOLDOWN};
pub use types::{Action, AttendanceEvent, Confirmation, ParseActionError, Subject};
