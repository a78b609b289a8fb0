//! The address book: known peers and their long-term public keys.
//!
//! Both session tasks read the book while resolving peers, and either may
//! insert a contact fetched from the directory, so lookups go through a
//! reader-writer lock. Persistence is a headerless CSV file with one
//! contact per row: ID, nickname, hex public key, first name, last name.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use crate::errors::StoreError;
use crate::identity::PeerId;
use crate::KEY_SIZE;

/// A known peer.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Contact {
    pub id: PeerId,
    pub public_key: [u8; KEY_SIZE],
    pub nickname: String,
    pub first_name: String,
    pub last_name: String,
}

impl Contact {
    /// A contact with only the fields the directory can provide.
    pub fn new(id: PeerId, public_key: [u8; KEY_SIZE]) -> Self {
        Contact {
            id,
            public_key,
            nickname: String::new(),
            first_name: String::new(),
            last_name: String::new(),
        }
    }
}

/// Register of contacts, keyed by ID. Insertions are idempotent on the ID.
#[derive(Default)]
pub struct AddressBook {
    contacts: RwLock<HashMap<PeerId, Contact>>,
}

impl AddressBook {
    pub fn new() -> Self {
        AddressBook::default()
    }

    /// Look up a contact. Returns `None` when the peer is unknown.
    pub fn get(&self, id: &PeerId) -> Option<Contact> {
        self.contacts
            .read()
            .expect("address book lock poisoned")
            .get(id)
            .cloned()
    }

    /// Insert or replace a contact.
    pub fn add(&self, contact: Contact) {
        self.contacts
            .write()
            .expect("address book lock poisoned")
            .insert(contact.id, contact);
    }

    pub fn len(&self) -> usize {
        self.contacts
            .read()
            .expect("address book lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all contacts.
    pub fn contacts(&self) -> Vec<Contact> {
        self.contacts
            .read()
            .expect("address book lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Load contacts from a CSV file, replacing nothing that is not in
    /// the file.
    pub fn load_from_file(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)?;

        for (line, record) in reader.records().enumerate() {
            let record = record?;
            let contact = parse_contact(line, &record)?;
            self.add(contact);
        }
        Ok(())
    }

    /// Save all contacts to a CSV file.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(path)?;

        for contact in self.contacts() {
            writer.write_record(&[
                contact.id.to_string(),
                contact.nickname.clone(),
                hex::encode(contact.public_key),
                contact.first_name.clone(),
                contact.last_name.clone(),
            ])?;
        }
        writer.flush().map_err(StoreError::Io)?;
        Ok(())
    }
}

fn parse_contact(line: usize, record: &csv::StringRecord) -> Result<Contact, StoreError> {
    let bad = |reason: &str| StoreError::BadRecord {
        record: line,
        reason: reason.to_string(),
    };

    if record.len() < 3 {
        return Err(bad("expected at least ID, nickname and public key"));
    }

    let id = PeerId::new(record.get(0).unwrap_or_default())
        .map_err(|_| bad("invalid contact ID"))?;

    let key_bytes =
        hex::decode(record.get(2).unwrap_or_default()).map_err(|_| bad("invalid hex key"))?;
    let public_key: [u8; KEY_SIZE] = key_bytes
        .try_into()
        .map_err(|_| bad("public key must be 32 bytes"))?;

    Ok(Contact {
        id,
        public_key,
        nickname: record.get(1).unwrap_or_default().to_string(),
        first_name: record.get(3).unwrap_or_default().to_string(),
        last_name: record.get(4).unwrap_or_default().to_string(),
    })
}
