pub mod http;
pub mod threading;
