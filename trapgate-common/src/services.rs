use std::path::Path;
use std::sync::Arc;

use crate::{CredentialPolicy, EventLog, TrapgateConfig};

/// Process-wide shared state handed to every session. The policy is
/// read-only after load; the event log serializes its own appends.
#[derive(Debug, Clone)]
pub struct Services {
    pub config: Arc<TrapgateConfig>,
    pub policy: Arc<CredentialPolicy>,
    pub events: Arc<EventLog>,
}

impl Services {
    pub fn new(config: TrapgateConfig) -> Self {
        let policy = CredentialPolicy::load(Path::new(&config.credentials_file));
        let events = EventLog::new(&config.event_log);
        Services {
            config: Arc::new(config),
            policy: Arc::new(policy),
            events: Arc::new(events),
        }
    }
}
