//! HTTP surface hosting the admission middleware.

mod middleware;
mod server;

pub use middleware::{
    admission, request_id, request_logger, AdmissionState, RequestId, RequestLoggerState,
    REJECTION_REASON, REQUEST_ID_HEADER,
};
pub use server::{router, AppState, HttpServer, RouterSettings};
