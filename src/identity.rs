//! Node Identity
//!
//! Every node owns a random 8-hex-character id, generated once and
//! persisted. The wire carries only its 16-bit hash; the uppercase hex
//! rendering of that hash is the human-shareable friend code.

use anyhow::Result;
use rand::Rng;

use crate::bluetooth::protocol::hash16;
use crate::persistence::KeyValueStore;

/// Store key holding the persistent node id.
pub const PEER_ID_KEY: &str = "mesh_peer_id";

/// Store key holding the display nickname.
pub const NICKNAME_KEY: &str = "mesh_nickname";

/// The local node's identity and everything derived from it.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub node_id: String,
    pub node_hash: u16,
    pub friend_code: String,
    pub nickname: String,
}

impl LocalIdentity {
    /// Load the persisted identity, generating and storing a fresh one on
    /// first run.
    pub fn load_or_create(store: &dyn KeyValueStore) -> Result<Self> {
        let node_id = match store.get_string(PEER_ID_KEY)? {
            Some(id) if !id.is_empty() => id,
            _ => {
                let id = generate_node_id();
                store.set_string(PEER_ID_KEY, &id)?;
                log::info!("generated new node id {id}");
                id
            }
        };

        let nickname = match store.get_string(NICKNAME_KEY)? {
            Some(name) if !name.is_empty() => name,
            _ => {
                let name = format!("user-{}", &node_id[..node_id.len().min(4)]);
                store.set_string(NICKNAME_KEY, &name)?;
                name
            }
        };

        let node_hash = hash16(&node_id);
        Ok(Self {
            node_id,
            node_hash,
            friend_code: friend_code_of(node_hash),
            nickname,
        })
    }
}

/// Random 8-hex-character node id.
pub fn generate_node_id() -> String {
    let value: u32 = rand::thread_rng().gen();
    format!("{value:08x}")
}

/// Uppercase 4-hex rendering of a node hash.
pub fn friend_code_of(node_hash: u16) -> String {
    format!("{node_hash:04X}")
}

/// Parse a shared friend code back into the node hash it renders.
pub fn parse_friend_code(code: &str) -> Option<u16> {
    let trimmed = code.trim();
    if trimmed.is_empty() || trimmed.len() > 4 {
        return None;
    }
    u16::from_str_radix(trimmed, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;

    #[test]
    fn identity_is_created_once_and_reloaded() {
        let store = MemoryStore::new();
        let first = LocalIdentity::load_or_create(&store).unwrap();
        let second = LocalIdentity::load_or_create(&store).unwrap();

        assert_eq!(first.node_id, second.node_id);
        assert_eq!(first.node_hash, second.node_hash);
        assert_eq!(first.node_id.len(), 8);
        assert!(first.node_id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn friend_code_round_trips_through_parse() {
        let store = MemoryStore::new();
        let identity = LocalIdentity::load_or_create(&store).unwrap();

        assert_eq!(identity.friend_code.len(), 4);
        assert_eq!(
            parse_friend_code(&identity.friend_code),
            Some(identity.node_hash)
        );
        // Lowercase input parses to the same hash.
        assert_eq!(
            parse_friend_code(&identity.friend_code.to_lowercase()),
            Some(identity.node_hash)
        );
    }

    #[test]
    fn bad_friend_codes_are_rejected() {
        assert_eq!(parse_friend_code(""), None);
        assert_eq!(parse_friend_code("XYZ!"), None);
        assert_eq!(parse_friend_code("12345"), None);
    }

    #[test]
    fn default_nickname_is_derived_and_persisted() {
        let store = MemoryStore::new();
        let identity = LocalIdentity::load_or_create(&store).unwrap();
        assert!(identity.nickname.starts_with("user-"));
        assert_eq!(
            store.get_string(NICKNAME_KEY).unwrap(),
            Some(identity.nickname)
        );
    }
}
