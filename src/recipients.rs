//! Recipient resolution. Consumes the external family/relationship graph
//! through the `ContactDirectory` contract and produces the ordered,
//! deduplicated recipient set for one escalation action.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::enums::{ChannelKind, RecipientRole};
use crate::models::{ContactChannel, ContactRecord, Recipient};

/// External family/relationship graph. The engine never stores contacts
/// itself; the surrounding application supplies them.
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn contacts_for(&self, patient_id: Uuid) -> Vec<ContactRecord>;
}

/// In-memory directory used in tests and by embedders without a live
/// relationship graph.
#[derive(Default)]
pub struct InMemoryDirectory {
    contacts: RwLock<HashMap<Uuid, Vec<ContactRecord>>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_contact(&self, patient_id: Uuid, contact: ContactRecord) {
        let mut contacts = match self.contacts.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        contacts.entry(patient_id).or_default().push(contact);
    }
}

#[async_trait]
impl ContactDirectory for InMemoryDirectory {
    async fn contacts_for(&self, patient_id: Uuid) -> Vec<ContactRecord> {
        let contacts = match self.contacts.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        contacts.get(&patient_id).cloned().unwrap_or_default()
    }
}

/// Resolves the recipient set for one tier action.
pub struct RecipientResolver {
    directory: Arc<dyn ContactDirectory>,
}

impl RecipientResolver {
    pub fn new(directory: Arc<dyn ContactDirectory>) -> Self {
        Self { directory }
    }

    /// Ordered, deduplicated recipients for the given roles, restricted
    /// to the allowed channels. Ordering: explicit notify-first flag,
    /// then relationship seniority, then the numeric priority field.
    /// Contacts that are disabled or have no enabled channel in the
    /// allowed list are never returned.
    pub async fn resolve(
        &self,
        patient_id: Uuid,
        roles: &[RecipientRole],
        allowed_channels: &[ChannelKind],
    ) -> Vec<Recipient> {
        let contacts = self.directory.contacts_for(patient_id).await;

        // Merge duplicate directory rows by contact identity first, so a
        // spouse who is also listed as primary caregiver appears once with
        // the union of roles and channels.
        let mut merged: HashMap<Uuid, ContactRecord> = HashMap::new();
        for contact in contacts {
            match merged.get_mut(&contact.id) {
                Some(existing) => {
                    for role in &contact.roles {
                        if !existing.roles.contains(role) {
                            existing.roles.push(*role);
                        }
                    }
                    for channel in &contact.channels {
                        if !existing.channels.contains(channel) {
                            existing.channels.push(channel.clone());
                        }
                    }
                    existing.notify_first |= contact.notify_first;
                    existing.priority = existing.priority.min(contact.priority);
                }
                None => {
                    merged.insert(contact.id, contact);
                }
            }
        }

        let mut eligible: Vec<ContactRecord> = merged
            .into_values()
            .filter(|c| !c.disabled)
            .filter(|c| c.roles.iter().any(|r| roles.contains(r)))
            .filter(|c| !eligible_channels(&c.channels, allowed_channels).is_empty())
            .collect();

        eligible.sort_by(|a, b| {
            b.notify_first
                .cmp(&a.notify_first)
                .then(
                    b.relationship
                        .seniority_weight()
                        .cmp(&a.relationship.seniority_weight()),
                )
                .then(a.priority.cmp(&b.priority))
                .then(a.name.cmp(&b.name))
        });

        eligible
            .into_iter()
            .map(|c| {
                let channels = eligible_channels(&c.channels, allowed_channels);
                Recipient {
                    id: c.id,
                    name: c.name,
                    roles: c.roles,
                    relationship: c.relationship,
                    channels,
                    locale: c.locale,
                    formal_address: c.formal_address,
                }
            })
            .collect()
    }
}

/// Intersect a contact's enabled channels with the allowed list,
/// preserving the tier's preference order.
fn eligible_channels(channels: &[ContactChannel], allowed: &[ChannelKind]) -> Vec<ContactChannel> {
    allowed
        .iter()
        .filter_map(|kind| {
            channels
                .iter()
                .find(|c| c.kind == *kind && c.enabled)
                .cloned()
        })
        .collect()
}
