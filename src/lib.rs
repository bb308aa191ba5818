// Re-export needed modules for testing
pub mod call;
pub mod credentials;
pub mod events;
pub mod models;
pub mod sync;
pub mod transport;
pub mod utils;

// Re-export main types for convenience
pub use models::*;
pub use sync::SyncClient; // Expose the sync engine directly
