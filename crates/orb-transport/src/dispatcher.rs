//! Operation-name request dispatch

use crate::connection::{Connection, RequestDispatcher, Response};
use crate::error::Result;
use crate::message::RequestMessage;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

/// Operation handler function type
pub type OperationHandler = Arc<dyn Fn(Bytes) -> Result<Bytes> + Send + Sync>;

/// Dispatches requests to handlers registered by operation name.
///
/// Handler errors become system exception replies carrying the error text.
#[derive(Default)]
pub struct OperationTable {
    operations: RwLock<HashMap<String, OperationHandler>>,
}

impl OperationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation handler, replacing any previous one.
    pub fn register<F>(&self, operation: impl Into<String>, handler: F)
    where
        F: Fn(Bytes) -> Result<Bytes> + Send + Sync + 'static,
    {
        let operation = operation.into();
        debug!("Registering operation {}", operation);
        self.operations.write().insert(operation, Arc::new(handler));
    }

    pub fn get(&self, operation: &str) -> Option<OperationHandler> {
        self.operations.read().get(operation).cloned()
    }

    pub fn operations(&self) -> Vec<String> {
        let mut names: Vec<String> = self.operations.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl RequestDispatcher for OperationTable {
    fn dispatch(&self, connection: &Arc<Connection>, request: &RequestMessage) -> Response {
        // the table lock is released before the handler runs
        let Some(handler) = self.get(&request.operation) else {
            debug!(
                "No operation {:?} for request {} on connection {}",
                request.operation,
                request.request_id,
                connection.id()
            );
            return Response::system_exception(&format!("BAD_OPERATION: {}", request.operation));
        };
        match handler(request.body.clone()) {
            Ok(body) => Response::ok(body),
            Err(e) => {
                error!("Operation {} failed: {}", request.operation, e);
                Response::system_exception(&e.to_string())
            }
        }
    }
}
