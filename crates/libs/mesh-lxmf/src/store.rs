//! Content-addressed message storage: one file per message hash, plus a
//! per-conversation index so the UI layer can list threads without
//! scanning every stored message.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::LxmfError;
use crate::message::Message;
use crate::state::MessageState;
use crate::wire::WireMessage;

/// Lightweight metadata readable without parsing the signature/envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMeta {
    pub peer: [u8; 16],
    pub state: MessageState,
    pub timestamp: f64,
    pub incoming: bool,
}

pub trait MessageStore: Send + Sync {
    fn save_message(&self, msg: &Message) -> Result<(), LxmfError>;
    fn get_message(&self, hash: &[u8; 32]) -> Result<Message, LxmfError>;
    fn get_meta(&self, hash: &[u8; 32]) -> Result<MessageMeta, LxmfError>;
    fn update_message_state(&self, hash: &[u8; 32], new_state: MessageState) -> Result<(), LxmfError>;
    fn get_conversations(&self) -> Result<Vec<[u8; 16]>, LxmfError>;
    fn get_messages_for_conversation(&self, peer: &[u8; 16]) -> Result<Vec<[u8; 32]>, LxmfError>;
    fn delete_conversation(&self, peer: &[u8; 16]) -> Result<(), LxmfError>;
}

/// `peer` is the conversation key: the destination for an outbound message,
/// the source for an inbound one.
fn conversation_peer(msg: &Message) -> [u8; 16] {
    if msg.incoming {
        msg.source()
    } else {
        msg.destination()
    }
}

type ConversationIndex = BTreeMap<[u8; 16], Vec<[u8; 32]>>;

pub struct FileMessageStore {
    root: PathBuf,
    index: RwLock<ConversationIndex>,
}

impl FileMessageStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, LxmfError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("messages")).map_err(|e| LxmfError::Io(e.to_string()))?;
        let index = Self::load_index(&root)?;
        Ok(Self { root, index: RwLock::new(index) })
    }

    fn index_path(root: &Path) -> PathBuf {
        root.join("conversations.idx")
    }

    fn load_index(root: &Path) -> Result<ConversationIndex, LxmfError> {
        let path = Self::index_path(root);
        if !path.exists() {
            return Ok(ConversationIndex::new());
        }
        let bytes = fs::read(&path).map_err(|e| LxmfError::Io(e.to_string()))?;
        if bytes.is_empty() {
            return Ok(ConversationIndex::new());
        }
        rmp_serde::from_slice(&bytes).map_err(|e| LxmfError::Decode(e.to_string()))
    }

    fn persist_index(&self, index: &ConversationIndex) -> Result<(), LxmfError> {
        let bytes = rmp_serde::to_vec(index).map_err(|e| LxmfError::Encode(e.to_string()))?;
        fs::write(Self::index_path(&self.root), bytes).map_err(|e| LxmfError::Io(e.to_string()))
    }

    fn message_path(&self, hash: &[u8; 32]) -> PathBuf {
        self.root.join("messages").join(hex::encode(hash))
    }

    fn meta_path(&self, hash: &[u8; 32]) -> PathBuf {
        self.root.join("messages").join(format!("{}.meta", hex::encode(hash)))
    }
}

impl MessageStore for FileMessageStore {
    fn save_message(&self, msg: &Message) -> Result<(), LxmfError> {
        let hash = msg.hash();
        let body_path = self.message_path(&hash);
        let is_new = !body_path.exists();

        fs::write(&body_path, msg.wire.pack_storage()?).map_err(|e| LxmfError::Io(e.to_string()))?;
        let meta = MessageMeta { peer: conversation_peer(msg), state: msg.state, timestamp: msg.timestamp, incoming: msg.incoming };
        let meta_bytes = rmp_serde::to_vec(&meta).map_err(|e| LxmfError::Encode(e.to_string()))?;
        fs::write(self.meta_path(&hash), meta_bytes).map_err(|e| LxmfError::Io(e.to_string()))?;

        if is_new {
            let mut index = self.index.write().unwrap();
            index.entry(meta.peer).or_default().push(hash);
            self.persist_index(&index)?;
        }
        Ok(())
    }

    fn get_message(&self, hash: &[u8; 32]) -> Result<Message, LxmfError> {
        let bytes = fs::read(self.message_path(hash)).map_err(|_| LxmfError::NotFound)?;
        let wire = WireMessage::unpack_storage(&bytes)?;
        let meta = self.get_meta(hash)?;
        Ok(Message { wire, timestamp: meta.timestamp, state: meta.state, incoming: meta.incoming })
    }

    fn get_meta(&self, hash: &[u8; 32]) -> Result<MessageMeta, LxmfError> {
        let bytes = fs::read(self.meta_path(hash)).map_err(|_| LxmfError::NotFound)?;
        rmp_serde::from_slice(&bytes).map_err(|e| LxmfError::Decode(e.to_string()))
    }

    fn update_message_state(&self, hash: &[u8; 32], new_state: MessageState) -> Result<(), LxmfError> {
        let mut meta = self.get_meta(hash)?;
        meta.state = new_state;
        let meta_bytes = rmp_serde::to_vec(&meta).map_err(|e| LxmfError::Encode(e.to_string()))?;
        fs::write(self.meta_path(hash), meta_bytes).map_err(|e| LxmfError::Io(e.to_string()))
    }

    fn get_conversations(&self) -> Result<Vec<[u8; 16]>, LxmfError> {
        Ok(self.index.read().unwrap().keys().copied().collect())
    }

    fn get_messages_for_conversation(&self, peer: &[u8; 16]) -> Result<Vec<[u8; 32]>, LxmfError> {
        Ok(self.index.read().unwrap().get(peer).cloned().unwrap_or_default())
    }

    fn delete_conversation(&self, peer: &[u8; 16]) -> Result<(), LxmfError> {
        let hashes = {
            let mut index = self.index.write().unwrap();
            let hashes = index.remove(peer).unwrap_or_default();
            self.persist_index(&index)?;
            hashes
        };
        for hash in hashes {
            let _ = fs::remove_file(self.message_path(&hash));
            let _ = fs::remove_file(self.meta_path(&hash));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Payload;

    fn sample_message() -> Message {
        let payload = Payload::new(1700000000.0, b"hello".to_vec(), Vec::new(), None);
        Message::new_outbound([7; 16], [9; 16], payload)
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMessageStore::open(dir.path()).unwrap();
        let msg = sample_message();
        store.save_message(&msg).unwrap();
        let loaded = store.get_message(&msg.hash()).unwrap();
        assert_eq!(loaded.wire.destination, msg.wire.destination);
        assert_eq!(loaded.state, msg.state);
    }

    #[test]
    fn saving_twice_keeps_one_conversation_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMessageStore::open(dir.path()).unwrap();
        let msg = sample_message();
        store.save_message(&msg).unwrap();
        store.save_message(&msg).unwrap();
        let hashes = store.get_messages_for_conversation(&msg.destination()).unwrap();
        assert_eq!(hashes.len(), 1);
    }

    #[test]
    fn update_state_leaves_other_fields_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMessageStore::open(dir.path()).unwrap();
        let msg = sample_message();
        store.save_message(&msg).unwrap();
        store.update_message_state(&msg.hash(), MessageState::Delivered).unwrap();
        let meta = store.get_meta(&msg.hash()).unwrap();
        assert_eq!(meta.state, MessageState::Delivered);
        assert_eq!(meta.timestamp, msg.timestamp);
    }

    #[test]
    fn delete_conversation_removes_index_and_bodies() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMessageStore::open(dir.path()).unwrap();
        let msg = sample_message();
        store.save_message(&msg).unwrap();
        store.delete_conversation(&msg.destination()).unwrap();
        assert!(store.get_messages_for_conversation(&msg.destination()).unwrap().is_empty());
        assert!(store.get_message(&msg.hash()).is_err());
    }

    #[test]
    fn index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let msg = sample_message();
        {
            let store = FileMessageStore::open(dir.path()).unwrap();
            store.save_message(&msg).unwrap();
        }
        let reopened = FileMessageStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get_conversations().unwrap(), vec![msg.destination()]);
    }
}
