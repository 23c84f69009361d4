//! Durable session store access (PostgREST interface)

pub mod accounts;
pub mod bots;
pub mod characters;
pub mod client;
pub mod sessions;

pub use accounts::AccountStore;
pub use bots::BotStore;
pub use characters::CharacterStore;
pub use client::{PgRestClient, StoreError};
pub use sessions::SessionStore;
