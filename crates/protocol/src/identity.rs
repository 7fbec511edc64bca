//! Runner identity derivation.
//!
//! A runner's id is a pure function of its name and token, so a restarted
//! runner re-registers under the same id and the gateway can hand its
//! previous registration back (reclaim).

use sha2::{Digest, Sha256};

/// `runner_<normalized-name>_<first 12 hex chars of sha256(token)>`.
pub fn runner_id(runner_name: &str, token: &str) -> String {
    let digest = hex::encode(Sha256::digest(token.as_bytes()));
    format!("runner_{}_{}", normalize(runner_name), &digest[..12])
}

/// Lowercase the name and collapse every non-alphanumeric run to a single
/// dash. The token hash disambiguates collisions.
fn normalize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = true;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("runner");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_token_same_id() {
        let a = runner_id("Dev Box", "secret-token");
        let b = runner_id("Dev Box", "secret-token");
        assert_eq!(a, b);
    }

    #[test]
    fn different_tokens_differ() {
        assert_ne!(runner_id("box", "tok-a"), runner_id("box", "tok-b"));
    }

    #[test]
    fn id_shape() {
        let id = runner_id("Dev Box #1", "secret");
        assert!(id.starts_with("runner_dev-box-1_"), "{id}");
        let hash_part = id.rsplit('_').next().unwrap();
        assert_eq!(hash_part.len(), 12);
        assert!(hash_part.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn empty_name_falls_back() {
        let id = runner_id("  ", "secret");
        assert!(id.starts_with("runner_runner_"), "{id}");
    }
}
