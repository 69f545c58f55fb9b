// Fetch source abstraction — pluggable backends for HTTP and test fakes.

pub mod http;
pub mod traits;

pub use http::HttpImageSource;
pub use traits::{ImageBody, ImageSource};
