use std::sync::Arc;

use tokio::runtime::Handle;

use crate::master::{LocalMaster, MasterProxy};

/// Process-wide services handed to every publisher and subscriber.
#[derive(Clone)]
pub struct Context {
    master: Arc<dyn MasterProxy>,
    handle: Handle,
}

impl Context {
    pub fn new(master: Arc<dyn MasterProxy>, handle: Handle) -> Self {
        Self { master, handle }
    }

    /// Context on the current Tokio runtime with an in-process master.
    ///
    /// Panics outside a Tokio runtime, like [`Handle::current`].
    pub fn local() -> Self {
        Self::new(Arc::new(LocalMaster::new()), Handle::current())
    }

    pub fn master(&self) -> &Arc<dyn MasterProxy> {
        &self.master
    }

    /// Runtime the actor tasks are spawned on.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}
