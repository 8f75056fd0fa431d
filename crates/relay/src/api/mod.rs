// REST surface: history paging and presence lookups for enrolled users.

pub mod rooms;

pub use rooms::router;
