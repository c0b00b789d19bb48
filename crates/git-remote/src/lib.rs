/**
 * Narrow interface over the host git binary:
 *  rev-parse, cat-file, merge-base, unpack-objects,
 *  pack-objects.
 */
pub mod git;
/**
 * The reference helper itself: pack synchronization,
 *  merge-ancestor analysis, and push encoding.
 */
pub mod helper;
/**
 * The git remote-helper line protocol
 *  (capabilities / list / fetch / push).
 */
pub mod protocol;
/**
 * Local per-remote cache of ingested packs and
 *  per-device branch heads.
 */
pub mod refdb;
/**
 * Pseudo-ref and pack-infix codecs shared by list,
 *  fetch, and push.
 */
pub mod refs;
/**
 * Scripted stand-ins for the git subprocess, used by
 *  unit and integration tests.
 */
pub mod testkit;
