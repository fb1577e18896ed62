pub mod admin;
pub mod channels;
pub mod messages;
pub mod permissions;
pub mod presence;
pub mod tree;
