// Live room state: one actor per active room, reached through the registry.

pub mod actor;
pub mod broker;
pub mod command;
pub mod registry;
pub mod sequencer;
pub mod typing;

pub use command::{Admission, Member, PresenceSnapshot, WriteReceipt};
pub use registry::{RoomRegistry, RoomSettings};
