mod stat;
mod user;

pub use stat::*;
pub use user::*;
