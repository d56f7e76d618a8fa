pub mod router;

pub use router::{
    apply_forwarding_headers, request_id, ForwardingContext, RouteTarget, Router, X_REQUEST_ID,
};
