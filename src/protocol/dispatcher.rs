use crate::error::{constants, NetworkError, Result};
use crate::protocol::request::{Request, RequestEvent, Response};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

type HandlerFn = dyn Fn(&Request) -> Result<Option<Response>> + Send + Sync + 'static;

/// Routes requests to the application handler registered for their event.
///
/// A handler may answer with a [`Response`], which the controller delivers.
#[derive(Clone)]
pub struct Dispatcher {
    handlers: Arc<RwLock<HashMap<RequestEvent, Arc<HandlerFn>>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register `handler` for `event`, replacing any previous one.
    pub fn register<F>(&self, event: RequestEvent, handler: F) -> Result<()>
    where
        F: Fn(&Request) -> Result<Option<Response>> + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().map_err(|_| {
            NetworkError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string())
        })?;

        handlers.insert(event, Arc::new(handler));
        Ok(())
    }

    pub fn is_registered(&self, event: RequestEvent) -> bool {
        self.handlers
            .read()
            .map(|h| h.contains_key(&event))
            .unwrap_or(false)
    }

    pub fn dispatch(&self, request: &Request) -> Result<Option<Response>> {
        // Clone the handler out so a slow handler never holds the registry lock.
        let handler = {
            let handlers = self.handlers.read().map_err(|_| {
                NetworkError::Custom(constants::ERR_DISPATCHER_READ_LOCK.to_string())
            })?;
            handlers.get(&request.event()).cloned()
        };

        match handler {
            Some(handler) => handler(request),
            None => Err(NetworkError::UnhandledEvent(request.event().to_string())),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.handlers.read().map(|h| h.len()).unwrap_or(0);
        f.debug_struct("Dispatcher").field("handlers", &count).finish()
    }
}
