pub mod context;
pub mod key;
pub mod password;
pub mod role;

pub use context::{SecurityContext, SecurityContextBuilder};
pub use key::{KeyExpression, KeyName};
pub use password::{Password, PasswordAlgorithm};
pub use role::{Action, Grant, Role, RoleName, User, UserName};
