pub mod authorizer;
pub mod controller_handler;

pub use authorizer::{AdminList, Authorizer};
pub use controller_handler::Controller;
