// Expert analysis: deduplicated, supervised provider calls.

mod dedup;
mod supervisor;

pub use dedup::{dedup_key, normalize_content};
pub use supervisor::{ExpertError, ExpertSettings, ExpertSupervisor, ExpertTicket};
