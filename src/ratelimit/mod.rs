//! Fleet-wide quota logic and usage bookkeeping.

mod clock;
mod decision;
mod key;
mod node;
mod recorder;
mod settings;
mod step;
mod store;
mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::{decide, Decision};
pub use key::{QuotaKey, ALL_PRINCIPALS};
pub use node::NodeIdentity;
pub use recorder::{RecordedUsage, UsageRecorder};
pub use settings::{
    LimitScope, LimiterSettings, MetricKind, StoreFailurePolicy, DEFAULT_STORE_TIMEOUT,
    REMAINING_REQUESTS_HEADER, REMAINING_TOKENS_HEADER,
};
pub use step::{QuotaStep, UsageSnapshot};
pub use store::{MemoryStore, StoreError, UsageStore};
pub use window::{http_date, Window, WINDOW_EPOCH_UNIX_SECS};
