//! Standard handler library
//!
//! Collection of built-in action handlers for common operations

mod debug;
mod http;
mod transform;

pub use debug::DebugLogHandler;
pub use http::HttpRequestHandler;
pub use transform::{JsonParseHandler, JsonStringifyHandler};

use spoolengine::HandlerCatalog;
use std::sync::Arc;

/// Register all standard handlers with a catalog
pub fn register_all(catalog: &mut HandlerCatalog) {
    catalog.register(debug::descriptor(), Arc::new(DebugLogHandler));
    catalog.register(http::descriptor(), Arc::new(HttpRequestHandler::new()));
    catalog.register(transform::parse_descriptor(), Arc::new(JsonParseHandler));
    catalog.register(
        transform::stringify_descriptor(),
        Arc::new(JsonStringifyHandler),
    );
}
