/**
 * Broker client.
 *  Trades the per-device token for short-lived presigned
 *  bucket URLs and speaks the raw list/get/put side of
 *  the object store.
 */
pub mod broker;
/**
 * The cryptographic object clerk.
 *  Wraps every byte that crosses the network boundary in
 *  an authenticated-encryption envelope, content-addresses
 *  the ciphertext, and binds the bucket path into the
 *  plaintext header.
 */
pub mod clerk;
/**
 * Per-device configuration loading and validation.
 */
pub mod config;

pub mod prelude {
    pub use crate::broker::{BrokerClient, BrokerError, ListPage};
    pub use crate::clerk::{split_path, Clerk, ClerkError, PlaintextReader};
    pub use crate::config::{ClerkConfig, ConfigError};
}
