pub mod core;
mod handlers;
mod router;
mod util;

pub use router::create_proxy_router;
