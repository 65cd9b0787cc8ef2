//! Database query functions organized by domain.

pub mod accepted_invites;
pub mod address_book;
pub mod groups;
pub mod identity;
pub mod kx_sessions;
pub mod mediations;
pub mod outbox;
pub mod payments;
pub mod shared_files;
pub mod transfers;
