// Deck document wrapper using yrs (y-crdt Rust bindings).
//
// One instance holds the content of a single shard: an ordered list of
// pages plus a flat set of elements, each element owned by a page and
// carrying independently merged fields.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::block::ClientID;
use yrs::{Array, ArrayRef, Doc, Map, MapRef, ReadTxn, StateVector, Transact, Update};

use crate::types::{is_valid_element_id, KEY_SEPARATOR};

const PAGES_KEY: &str = "pages";
const ELEMENTS_KEY: &str = "elements";
const FIELDS_KEY: &str = "fields";

/// Length of the v1 encoding of an update that carries nothing.
pub const EMPTY_UPDATE_LEN: usize = 2;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("failed to decode update: {0}")]
    Decode(String),
    #[error("failed to apply update: {0}")]
    Apply(String),
    #[error("failed to decode state vector: {0}")]
    StateVector(String),
    #[error("invalid id {0:?}")]
    InvalidId(String),
    #[error("element {0:?} does not exist")]
    UnknownElement(String),
    #[error("failed to encode field value: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Field name → JSON value for one element.
pub type ElementFields = BTreeMap<String, Value>;

/// Flattened, read-only view of a deck document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeckView {
    pub pages: Vec<PageView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageView {
    pub id: String,
    pub elements: BTreeMap<String, ElementFields>,
}

impl DeckView {
    pub fn element(&self, element_id: &str) -> Option<&ElementFields> {
        self.pages.iter().find_map(|page| page.elements.get(element_id))
    }

    pub fn element_count(&self) -> usize {
        self.pages.iter().map(|page| page.elements.len()).sum()
    }

    pub fn page(&self, page_id: &str) -> Option<&PageView> {
        self.pages.iter().find(|page| page.id == page_id)
    }
}

/// Operations the corruption guard needs from a replica. Split out so the
/// rollback paths can be exercised with replicas that fail on demand.
pub trait Replica {
    fn encode_full(&self) -> Vec<u8>;

    fn apply_update(&self, update: &[u8]) -> Result<(), DocumentError>;

    /// Replace the whole state with a previously encoded full state.
    fn restore_from(&mut self, snapshot: &[u8]) -> Result<(), DocumentError>;

    /// Drop all content and start over from an empty document.
    fn reset_empty(&mut self);
}

/// Mergeable deck content for one shard.
///
/// Merge policy: every element field is its own last-writer-wins register
/// (concurrent writes are ordered by replica id, so all replicas pick the
/// same winner); page order is a list CRDT. Removing an element deletes its
/// marker and all fields; fields written concurrently with the removal stay
/// hidden because only marked elements appear in [`DeckView`].
pub struct DeckDocument {
    doc: Doc,
    pages: ArrayRef,
    elements: MapRef,
    fields: MapRef,
    /// Updates whose deletions target inserts this replica has not seen yet.
    deferred: Mutex<Vec<Vec<u8>>>,
}

impl DeckDocument {
    /// Create a new empty document with a random replica id.
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    /// Create a document with a specific replica id (for deterministic testing).
    pub fn with_client_id(client_id: u64) -> Self {
        let options = yrs::Options { client_id, ..Default::default() };
        Self::from_doc(Doc::with_options(options))
    }

    /// Load a document from a full-state encoding.
    pub fn from_state(data: &[u8]) -> Result<Self, DocumentError> {
        let document = Self::new();
        Replica::apply_update(&document, data)?;
        Ok(document)
    }

    fn from_doc(doc: Doc) -> Self {
        let pages = doc.get_or_insert_array(PAGES_KEY);
        let elements = doc.get_or_insert_map(ELEMENTS_KEY);
        let fields = doc.get_or_insert_map(FIELDS_KEY);
        Self { doc, pages, elements, fields, deferred: Mutex::new(Vec::new()) }
    }

    /// Encode the full document state as a binary blob.
    pub fn encode_full(&self) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode the state vector (what this replica has already seen).
    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Compute an update containing everything the peer behind `peer_vector` lacks.
    pub fn encode_diff(&self, peer_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let sv = StateVector::decode_v1(peer_vector)
            .map_err(|error| DocumentError::StateVector(error.to_string()))?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    /// Apply a binary update. Decoding happens before the transaction opens,
    /// so undecodable input never touches the document.
    ///
    /// yrs silently drops deletions aimed at a replica it has never heard
    /// from, so an update whose deletions reach past our state vector is kept
    /// and applied again once the inserts it targets have arrived.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), DocumentError> {
        let incomplete = self.apply_once(update)?;
        let mut deferred = self.deferred.lock().expect("deferred updates lock poisoned");
        if incomplete {
            deferred.push(update.to_vec());
        }
        self.retry_deferred(&mut deferred);
        Ok(())
    }

    /// Number of updates still waiting for the inserts their deletions target.
    pub fn deferred_count(&self) -> usize {
        self.deferred.lock().expect("deferred updates lock poisoned").len()
    }

    /// Apply `update` and report whether some of its deletions could not land.
    fn apply_once(&self, update: &[u8]) -> Result<bool, DocumentError> {
        let decoded =
            Update::decode_v1(update).map_err(|error| DocumentError::Decode(error.to_string()))?;
        let deletion_ends: Vec<(ClientID, u32)> = decoded
            .delete_set()
            .iter()
            .filter_map(|(client, ranges)| {
                ranges.iter().map(|range| range.end).max().map(|end| (*client, end))
            })
            .collect();

        let mut txn = self.doc.transact_mut();
        txn.apply_update(decoded).map_err(|error| DocumentError::Apply(error.to_string()))?;
        let seen = txn.state_vector();
        Ok(deletion_ends.iter().any(|(client, end)| *end > seen.get(client)))
    }

    fn retry_deferred(&self, deferred: &mut Vec<Vec<u8>>) {
        loop {
            let waiting = deferred.len();
            for update in std::mem::take(deferred) {
                // Re-applying the already integrated part is a no-op in yrs.
                if let Ok(true) = self.apply_once(&update) {
                    deferred.push(update);
                }
            }
            if deferred.len() == waiting {
                break;
            }
        }
    }

    /// Append a page (or insert it at `index`). Existing pages are left alone.
    pub fn add_page(&self, page_id: &str, index: Option<u32>) -> Result<Vec<u8>, DocumentError> {
        ensure_valid_id(page_id)?;
        let mut txn = self.doc.transact_mut();
        let present = self.pages.iter(&txn).any(|value| value.to_string(&txn) == page_id);
        if !present {
            let len = self.pages.len(&txn);
            let index = index.map_or(len, |index| index.min(len));
            self.pages.insert(&mut txn, index, page_id);
        }
        Ok(txn.encode_update_v1())
    }

    /// Remove a page together with every element it owns.
    pub fn remove_page(&self, page_id: &str) -> Result<Vec<u8>, DocumentError> {
        let mut txn = self.doc.transact_mut();
        let positions: Vec<u32> = self
            .pages
            .iter(&txn)
            .enumerate()
            .filter(|(_, value)| value.clone().to_string(&txn) == page_id)
            .map(|(index, _)| index as u32)
            .collect();
        for index in positions.into_iter().rev() {
            self.pages.remove(&mut txn, index);
        }

        let owned: Vec<String> = self
            .elements
            .iter(&txn)
            .filter(|(_, page)| page.clone().to_string(&txn) == page_id)
            .map(|(element_id, _)| element_id.to_string())
            .collect();
        for element_id in owned {
            self.elements.remove(&mut txn, &element_id);
            let stale = field_keys_of(&self.fields, &txn, &element_id);
            for key in stale {
                self.fields.remove(&mut txn, &key);
            }
        }
        Ok(txn.encode_update_v1())
    }

    /// Create (or recreate) an element on `page_id` with the given fields.
    pub fn add_element(
        &self,
        page_id: &str,
        element_id: &str,
        fields: &serde_json::Map<String, Value>,
    ) -> Result<Vec<u8>, DocumentError> {
        ensure_valid_id(page_id)?;
        ensure_valid_id(element_id)?;
        let encoded = encode_fields(fields)?;

        let mut txn = self.doc.transact_mut();
        let present = self.pages.iter(&txn).any(|value| value.to_string(&txn) == page_id);
        if !present {
            let len = self.pages.len(&txn);
            self.pages.insert(&mut txn, len, page_id);
        }

        let stale = field_keys_of(&self.fields, &txn, element_id);
        for key in stale {
            self.fields.remove(&mut txn, &key);
        }
        self.elements.insert(&mut txn, element_id, page_id);
        for (field, value) in encoded {
            self.fields.insert(&mut txn, field_key(element_id, &field), value);
        }
        Ok(txn.encode_update_v1())
    }

    /// Overwrite individual fields of an existing element. A `null` value
    /// removes the field.
    pub fn update_element(
        &self,
        element_id: &str,
        fields: &serde_json::Map<String, Value>,
    ) -> Result<Vec<u8>, DocumentError> {
        let encoded = encode_fields(fields)?;
        let mut txn = self.doc.transact_mut();
        if !self.elements.contains_key(&txn, element_id) {
            return Err(DocumentError::UnknownElement(element_id.to_string()));
        }

        for (field, value) in encoded {
            let key = field_key(element_id, &field);
            if value == "null" {
                self.fields.remove(&mut txn, &key);
            } else {
                self.fields.insert(&mut txn, key, value);
            }
        }
        Ok(txn.encode_update_v1())
    }

    pub fn remove_element(&self, element_id: &str) -> Result<Vec<u8>, DocumentError> {
        let mut txn = self.doc.transact_mut();
        if self.elements.remove(&mut txn, element_id).is_none() {
            return Err(DocumentError::UnknownElement(element_id.to_string()));
        }
        let stale = field_keys_of(&self.fields, &txn, element_id);
        for key in stale {
            self.fields.remove(&mut txn, &key);
        }
        Ok(txn.encode_update_v1())
    }

    pub fn element_count(&self) -> usize {
        let txn = self.doc.transact();
        self.elements.len(&txn) as usize
    }

    /// Build the flattened view: pages in list order (duplicates from
    /// concurrent inserts collapsed), then pages only referenced by elements
    /// in id order.
    pub fn flatten(&self) -> DeckView {
        let txn = self.doc.transact();

        let mut element_pages: HashMap<String, String> = HashMap::new();
        for (element_id, page) in self.elements.iter(&txn) {
            element_pages.insert(element_id.to_string(), page.to_string(&txn));
        }

        let mut elements_by_page: BTreeMap<String, BTreeMap<String, ElementFields>> =
            BTreeMap::new();
        for (element_id, page_id) in &element_pages {
            elements_by_page
                .entry(page_id.clone())
                .or_default()
                .insert(element_id.clone(), ElementFields::new());
        }

        for (key, raw) in self.fields.iter(&txn) {
            let Some((element_id, field)) = key.split_once(KEY_SEPARATOR) else {
                continue;
            };
            let Some(page_id) = element_pages.get(element_id) else {
                continue;
            };
            let raw = raw.to_string(&txn);
            let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            if let Some(element) = elements_by_page
                .get_mut(page_id)
                .and_then(|elements| elements.get_mut(element_id))
            {
                element.insert(field.to_string(), value);
            }
        }

        let mut seen = HashSet::new();
        let mut pages = Vec::new();
        for value in self.pages.iter(&txn) {
            let page_id = value.to_string(&txn);
            if !seen.insert(page_id.clone()) {
                continue;
            }
            let elements = elements_by_page.remove(&page_id).unwrap_or_default();
            pages.push(PageView { id: page_id, elements });
        }
        for (page_id, elements) in elements_by_page {
            pages.push(PageView { id: page_id, elements });
        }

        DeckView { pages }
    }
}

impl Replica for DeckDocument {
    fn encode_full(&self) -> Vec<u8> {
        DeckDocument::encode_full(self)
    }

    fn apply_update(&self, update: &[u8]) -> Result<(), DocumentError> {
        DeckDocument::apply_update(self, update)
    }

    fn restore_from(&mut self, snapshot: &[u8]) -> Result<(), DocumentError> {
        // A fresh replica id keeps restored clocks from colliding with ours.
        *self = Self::from_state(snapshot)?;
        Ok(())
    }

    fn reset_empty(&mut self) {
        *self = Self::new();
    }
}

impl Default for DeckDocument {
    fn default() -> Self {
        Self::new()
    }
}

/// True when `update` carries no structs and no deletions.
pub fn is_empty_update(update: &[u8]) -> bool {
    update.len() <= EMPTY_UPDATE_LEN
}

fn ensure_valid_id(id: &str) -> Result<(), DocumentError> {
    if is_valid_element_id(id) {
        Ok(())
    } else {
        Err(DocumentError::InvalidId(id.to_string()))
    }
}

fn field_key(element_id: &str, field: &str) -> String {
    format!("{element_id}{KEY_SEPARATOR}{field}")
}

fn field_keys_of<T: ReadTxn>(fields: &MapRef, txn: &T, element_id: &str) -> Vec<String> {
    let prefix = format!("{element_id}{KEY_SEPARATOR}");
    fields.keys(txn).filter(|key| key.starts_with(&prefix)).map(str::to_string).collect()
}

fn encode_fields(
    fields: &serde_json::Map<String, Value>,
) -> Result<Vec<(String, String)>, DocumentError> {
    fields
        .iter()
        .map(|(field, value)| Ok((field.clone(), serde_json::to_string(value)?)))
        .collect()
}
