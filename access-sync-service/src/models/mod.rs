pub mod access;
pub mod identity;

pub use access::{
    AuthorizationRecord, Grant, MemberSnapshot, MembershipEvent, PermissionRole, RoleMapping,
};
pub use identity::{AccountState, Identity, LinkedAccount};
