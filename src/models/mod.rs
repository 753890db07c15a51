pub mod request;
pub mod route;
pub mod status;

pub use request::*;
pub use route::*;
pub use status::*;
