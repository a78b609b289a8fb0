//! Chat groups and the local group directory.
//!
//! The server has no concept of groups; everything lives client side. A
//! group is identified by its creator's ID plus 8 random bytes. The
//! directory keeps one entry per (creator, group ID) pair and merges
//! updates in place.

use std::path::Path;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;

use crate::errors::StoreError;
use crate::identity::PeerId;
use crate::GROUP_ID_SIZE;

/// A chat group. Identity is the (creator, group_id) pair.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Group {
    pub creator: PeerId,
    pub group_id: [u8; GROUP_ID_SIZE],
    pub name: String,
    pub members: Vec<PeerId>,
    pub created_at: u64,
    pub deleted: bool,
}

impl Group {
    /// Create a group with a freshly generated random ID. The creator is
    /// always part of the member list.
    pub fn new(creator: PeerId, name: &str, members: Vec<PeerId>) -> Self {
        let mut group_id = [0u8; GROUP_ID_SIZE];
        OsRng.fill_bytes(&mut group_id);

        let mut group = Group {
            creator,
            group_id,
            name: name.to_string(),
            members,
            created_at: unix_now(),
            deleted: false,
        };
        group.ensure_creator_member();
        group
    }

    fn ensure_creator_member(&mut self) {
        if !self.members.contains(&self.creator) {
            self.members.push(self.creator);
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Register of known groups.
#[derive(Default)]
pub struct GroupDirectory {
    groups: RwLock<Vec<Group>>,
}

impl GroupDirectory {
    pub fn new() -> Self {
        GroupDirectory::default()
    }

    /// Look up a group by its identity pair.
    pub fn get(&self, creator: &PeerId, group_id: &[u8; GROUP_ID_SIZE]) -> Option<Group> {
        self.groups
            .read()
            .expect("group directory lock poisoned")
            .iter()
            .find(|g| g.creator == *creator && g.group_id == *group_id)
            .cloned()
    }

    /// Insert a group or merge it onto the existing entry.
    ///
    /// A matching entry is updated in place: a non-empty name and a
    /// non-empty member list each replace the stored value, the deleted
    /// flag is taken over as-is. Only when no entry matches is the group
    /// appended. Either way the creator ends up in the member list.
    pub fn upsert(&self, group: Group) {
        let mut groups = self.groups.write().expect("group directory lock poisoned");

        if let Some(existing) = groups
            .iter_mut()
            .find(|g| g.creator == group.creator && g.group_id == group.group_id)
        {
            if !group.name.is_empty() {
                existing.name = group.name;
            }
            if !group.members.is_empty() {
                existing.members = group.members;
            }
            existing.deleted = group.deleted;
            existing.ensure_creator_member();
        } else {
            let mut group = group;
            group.ensure_creator_member();
            groups.push(group);
        }
    }

    /// Snapshot of all groups.
    pub fn groups(&self) -> Vec<Group> {
        self.groups
            .read()
            .expect("group directory lock poisoned")
            .clone()
    }

    pub fn len(&self) -> usize {
        self.groups
            .read()
            .expect("group directory lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load groups from a CSV file. Rows are
    /// `hexGroupID,creatorID,name,createdAt,member1;member2;...,deleted`.
    pub fn load_from_file(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)?;

        for (line, record) in reader.records().enumerate() {
            let record = record?;
            self.upsert(parse_group(line, &record)?);
        }
        Ok(())
    }

    /// Save all groups to a CSV file.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(path)?;

        for group in self.groups() {
            let members: Vec<String> = group.members.iter().map(|m| m.to_string()).collect();
            writer.write_record(&[
                hex::encode(group.group_id),
                group.creator.to_string(),
                group.name.clone(),
                group.created_at.to_string(),
                members.join(";"),
                if group.deleted { "1" } else { "0" }.to_string(),
            ])?;
        }
        writer.flush().map_err(StoreError::Io)?;
        Ok(())
    }
}

fn parse_group(line: usize, record: &csv::StringRecord) -> Result<Group, StoreError> {
    let bad = |reason: &str| StoreError::BadRecord {
        record: line,
        reason: reason.to_string(),
    };

    if record.len() < 6 {
        return Err(bad("expected 6 fields"));
    }

    let id_bytes = hex::decode(record.get(0).unwrap_or_default())
        .map_err(|_| bad("invalid hex group ID"))?;
    let group_id: [u8; GROUP_ID_SIZE] = id_bytes
        .try_into()
        .map_err(|_| bad("group ID must be 8 bytes"))?;

    let creator = PeerId::new(record.get(1).unwrap_or_default())
        .map_err(|_| bad("invalid creator ID"))?;

    let created_at = record
        .get(3)
        .unwrap_or_default()
        .parse::<u64>()
        .map_err(|_| bad("invalid creation timestamp"))?;

    let members_field = record.get(4).unwrap_or_default();
    let mut members = Vec::new();
    for part in members_field.split(';').filter(|p| !p.is_empty()) {
        members.push(PeerId::new(part).map_err(|_| bad("invalid member ID"))?);
    }

    let deleted = match record.get(5).unwrap_or_default() {
        "0" => false,
        "1" => true,
        _ => return Err(bad("deleted flag must be 0 or 1")),
    };

    Ok(Group {
        creator,
        group_id,
        name: record.get(2).unwrap_or_default().to_string(),
        members,
        created_at,
        deleted,
    })
}
