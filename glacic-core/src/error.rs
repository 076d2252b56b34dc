//! Top-level error type (spec §7): composes every sub-module's error
//! into the three-way classification the spec names (configuration /
//! kernel-programming / selection-failure), and centralizes
//! idempotent-collision detection.
//!
//! Grounded on `gnosis_vpn-root/src/routing::Error`'s pattern of a
//! flat top-level enum with `#[from]` variants per sub-error, and on
//! `nftables_ops.rs`'s `delete_table`'s string-matching on the kernel's
//! `ENOENT` message, generalized here to `EEXIST` for idempotent adds.

use thiserror::Error;

use crate::{address, command, firewall, group, manager, netlink, policy_routing};

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(#[from] address::Error),

    #[error(transparent)]
    Netlink(#[from] netlink::Error),

    #[error(transparent)]
    Firewall(#[from] firewall::Error),

    #[error(transparent)]
    PolicyRouting(#[from] policy_routing::Error),

    #[error(transparent)]
    Group(#[from] group::Error),

    #[error(transparent)]
    Manager(#[from] manager::Error),

    #[error(transparent)]
    Command(#[from] command::Error),
}

/// A kernel-programming rejection that should be treated as success
/// because the desired state already exists (spec §7's
/// "idempotent-collision" classification).
pub fn is_idempotent_collision(message: &str) -> bool {
    message.contains("File exists") || message.contains("EEXIST")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_file_exists_and_eexist() {
        assert!(is_idempotent_collision("RTNETLINK answers: File exists"));
        assert!(is_idempotent_collision("errno: EEXIST"));
        assert!(!is_idempotent_collision("Network is unreachable"));
    }
}
