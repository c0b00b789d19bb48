/**
 * The blob helper: key-to-object resolution over the
 *  clerk, with a cached bucket listing and per-key
 *  serialization.
 */
pub mod helper;
/**
 * Per-key exclusive locks, so at most one transfer or
 *  presence check runs per key at a time.
 */
pub mod key_locks;
/**
 * The git-annex external-special-remote protocol,
 *  including ASYNC job multiplexing.
 */
pub mod protocol;
/**
 * The background listing refresher.
 */
pub mod syncher;
