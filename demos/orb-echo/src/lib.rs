//! Echo service shared by the demo server and client
//!
//! Operations:
//! - `echo`: returns the request body unchanged
//! - `reverse`: returns the request body reversed
//! - `upper`: ASCII upper-cases the request body

use bytes::Bytes;
use orb_transport::OperationTable;
use tracing::info;

pub const OP_ECHO: &str = "echo";
pub const OP_REVERSE: &str = "reverse";
pub const OP_UPPER: &str = "upper";

pub const DEFAULT_PORT: u16 = 1049;

pub fn create_echo_operations() -> OperationTable {
    let operations = OperationTable::new();
    operations.register(OP_ECHO, |body: Bytes| {
        info!("{} called with {} bytes", OP_ECHO, body.len());
        Ok(body)
    });
    operations.register(OP_REVERSE, |body: Bytes| {
        info!("{} called with {} bytes", OP_REVERSE, body.len());
        let mut reversed = body.to_vec();
        reversed.reverse();
        Ok(Bytes::from(reversed))
    });
    operations.register(OP_UPPER, |body: Bytes| {
        Ok(Bytes::from(body.to_ascii_uppercase()))
    });
    operations
}
