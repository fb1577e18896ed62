pub mod entities;
pub mod events;
pub mod permissions;
