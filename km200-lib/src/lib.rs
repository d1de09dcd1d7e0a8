pub mod constants;
pub mod crypto;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod http;


// Re-export the client and tree types for easy access
pub use device::KM200;
pub use endpoint::{Endpoint, EndpointTree};
pub use error::KM200Error;
