//! Replicated document state for one room.
//!
//! A [`DocumentReplica`] owns a yrs `Doc` whose root is an XML fragment named
//! `"content"`: block elements (`p`, `table`, `li`, …) contain further
//! elements or text runs, and inline formatting lives on the text runs as
//! marks. Every local change is committed in a single transaction and yields
//! exactly one Update Delta; remote deltas merge idempotently and
//! commutatively, so replicas that saw the same set of deltas render the
//! same tree.
//!
//! ```text
//! editor ── TreeMutation[] ──► apply_local_change ──► ReplicaEvent(Local, delta) ──► transport
//! transport ── delta ───────► apply_remote_delta ──► ReplicaEvent(Remote, delta) ──► editor
//! ```
//!
//! Text indices are UTF-8 byte offsets into a run and must fall on character
//! boundaries.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use serde::{Deserialize, Serialize};
use yrs::types::text::YChange;
use yrs::types::xml::{
    Xml, XmlElementPrelim, XmlElementRef, XmlFragment, XmlFragmentRef, XmlOut, XmlTextPrelim,
    XmlTextRef,
};
use yrs::types::Attrs;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, Out, ReadTxn, StateVector, Text, Transact, TransactionMut, Update};

use crate::error::CollabError;
use crate::html::{self, HtmlNode};
use crate::locks::{lock, read, write};
use crate::room::RoomId;
use crate::validate;

/// Name of the root XML fragment inside every room document.
pub const CONTENT_ROOT: &str = "content";

const VOID_TAGS: &[&str] = &["br", "hr", "img", "input", "col", "wbr"];

// ───────────────────────────────────────────────────────────────────
// Mutations
// ───────────────────────────────────────────────────────────────────

/// Inline formatting on a text run (`strong`, `em`, `a` with `href`, …).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mark {
    pub name: String,
    pub attributes: BTreeMap<String, String>,
}

impl Mark {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    fn to_any(&self) -> Any {
        if self.attributes.is_empty() {
            return Any::Bool(true);
        }
        let map: HashMap<String, Any> = self
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), Any::String(v.as_str().into())))
            .collect();
        Any::Map(Arc::new(map))
    }

    fn from_any(name: &str, value: &Any) -> Option<Self> {
        match value {
            Any::Bool(true) => Some(Self::new(name)),
            Any::Map(map) => {
                let mut mark = Self::new(name);
                for (key, value) in map.iter() {
                    if let Any::String(s) = value {
                        mark.attributes.insert(key.clone(), s.to_string());
                    }
                }
                Some(mark)
            }
            _ => None,
        }
    }
}

fn marks_to_attrs(marks: &[Mark]) -> Attrs {
    marks
        .iter()
        .map(|m| (Arc::<str>::from(m.name.as_str()), m.to_any()))
        .collect()
}

/// One edit to the document tree. Paths are child indices from the root
/// fragment: `[0]` is the first block, `[0, 2]` its third child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeMutation {
    /// Insert an empty element at `index` among the children of `parent`.
    InsertElement { parent: Vec<u32>, index: u32, tag: String },
    /// Insert a new text run at `index` among the children of `parent`.
    InsertText {
        parent: Vec<u32>,
        index: u32,
        text: String,
        marks: Vec<Mark>,
    },
    /// Insert characters into an existing run.
    EditText {
        text: Vec<u32>,
        index: u32,
        insert: String,
        marks: Vec<Mark>,
    },
    DeleteText { text: Vec<u32>, index: u32, len: u32 },
    /// Apply `set` and remove `clear` marks over a range of a run.
    FormatText {
        text: Vec<u32>,
        index: u32,
        len: u32,
        set: Vec<Mark>,
        clear: Vec<String>,
    },
    SetAttribute {
        element: Vec<u32>,
        name: String,
        value: String,
    },
    RemoveAttribute { element: Vec<u32>, name: String },
    /// Remove `len` children of `parent` starting at `index`.
    RemoveNodes { parent: Vec<u32>, index: u32, len: u32 },
}

// ───────────────────────────────────────────────────────────────────
// Events
// ───────────────────────────────────────────────────────────────────

/// Where an applied change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Produced by this replica's editor; must be sent to peers.
    Local,
    /// Merged from a peer; must not be echoed back.
    Remote,
}

/// Emitted once per applied change.
#[derive(Debug, Clone)]
pub struct ReplicaEvent {
    pub origin: Origin,
    /// Update Delta describing the change.
    pub delta: Arc<[u8]>,
}

type Observer = Arc<dyn Fn(&ReplicaEvent) + Send + Sync>;

/// Keeps an observer registered; dropping it unsubscribes.
#[must_use = "dropping the subscription unsubscribes the observer"]
pub struct ReplicaSubscription {
    replica: Weak<DocumentReplica>,
    id: u64,
}

impl Drop for ReplicaSubscription {
    fn drop(&mut self) {
        if let Some(replica) = self.replica.upgrade() {
            write(&replica.observers).remove(&self.id);
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Tree navigation
// ───────────────────────────────────────────────────────────────────

/// A node that can hold children: the root fragment or an element.
enum Container {
    Root(XmlFragmentRef),
    Element(XmlElementRef),
}

impl Container {
    fn len<T: ReadTxn>(&self, txn: &T) -> u32 {
        match self {
            Self::Root(f) => f.len(txn),
            Self::Element(e) => e.len(txn),
        }
    }

    fn get<T: ReadTxn>(&self, txn: &T, index: u32) -> Option<XmlOut> {
        match self {
            Self::Root(f) => f.get(txn, index),
            Self::Element(e) => e.get(txn, index),
        }
    }

    fn insert_element(&self, txn: &mut TransactionMut, index: u32, tag: &str) -> XmlElementRef {
        match self {
            Self::Root(f) => f.insert(txn, index, XmlElementPrelim::empty(tag)),
            Self::Element(e) => e.insert(txn, index, XmlElementPrelim::empty(tag)),
        }
    }

    fn insert_text(&self, txn: &mut TransactionMut, index: u32) -> XmlTextRef {
        match self {
            Self::Root(f) => f.insert(txn, index, XmlTextPrelim::new("")),
            Self::Element(e) => e.insert(txn, index, XmlTextPrelim::new("")),
        }
    }

    fn remove_range(&self, txn: &mut TransactionMut, index: u32, len: u32) {
        match self {
            Self::Root(f) => f.remove_range(txn, index, len),
            Self::Element(e) => e.remove_range(txn, index, len),
        }
    }
}

fn container_at<T: ReadTxn>(
    txn: &T,
    root: &XmlFragmentRef,
    path: &[u32],
) -> Result<Container, CollabError> {
    let mut current = Container::Root(root.clone());
    for (depth, &index) in path.iter().enumerate() {
        match current.get(txn, index) {
            Some(XmlOut::Element(element)) => current = Container::Element(element),
            _ => {
                return Err(CollabError::InvalidPath {
                    path: path[..=depth].to_vec(),
                    expected: "element",
                })
            }
        }
    }
    Ok(current)
}

fn child_at<T: ReadTxn>(
    txn: &T,
    root: &XmlFragmentRef,
    path: &[u32],
    expected: &'static str,
) -> Result<XmlOut, CollabError> {
    let invalid = || CollabError::InvalidPath {
        path: path.to_vec(),
        expected,
    };
    let (&last, parent) = path.split_last().ok_or_else(invalid)?;
    container_at(txn, root, parent)?
        .get(txn, last)
        .ok_or_else(invalid)
}

fn text_at<T: ReadTxn>(txn: &T, root: &XmlFragmentRef, path: &[u32]) -> Result<XmlTextRef, CollabError> {
    match child_at(txn, root, path, "text run")? {
        XmlOut::Text(text) => Ok(text),
        _ => Err(CollabError::InvalidPath {
            path: path.to_vec(),
            expected: "text run",
        }),
    }
}

fn element_at<T: ReadTxn>(
    txn: &T,
    root: &XmlFragmentRef,
    path: &[u32],
) -> Result<XmlElementRef, CollabError> {
    match child_at(txn, root, path, "element")? {
        XmlOut::Element(element) => Ok(element),
        _ => Err(CollabError::InvalidPath {
            path: path.to_vec(),
            expected: "element",
        }),
    }
}

fn chunk_string<T: ReadTxn>(txn: &T, value: &Out) -> String {
    match value {
        Out::Any(Any::String(s)) => s.to_string(),
        other => other.clone().to_string(txn),
    }
}

fn plain_text<T: ReadTxn>(txn: &T, text: &XmlTextRef) -> String {
    text.diff(txn, YChange::identity)
        .iter()
        .map(|chunk| chunk_string(txn, &chunk.insert))
        .collect()
}

fn check_index(path: &[u32], index: u32, len: u32) -> Result<(), CollabError> {
    if index > len {
        return Err(CollabError::OutOfRange {
            path: path.to_vec(),
            index,
            len,
        });
    }
    Ok(())
}

fn check_name(name: &str) -> Result<(), CollabError> {
    if html::is_valid_name(name) {
        Ok(())
    } else {
        Err(CollabError::InvalidName(name.to_string()))
    }
}

fn check_marks(marks: &[Mark]) -> Result<(), CollabError> {
    for mark in marks {
        check_name(&mark.name)?;
        mark.attributes.keys().try_for_each(|key| check_name(key))?;
    }
    Ok(())
}

fn end_of(index: u32, len: u32) -> u32 {
    index.saturating_add(len)
}

/// Check a byte range of a run: within bounds and on char boundaries.
fn check_text_range<T: ReadTxn>(
    txn: &T,
    path: &[u32],
    text: &XmlTextRef,
    index: u32,
    len: u32,
) -> Result<(), CollabError> {
    let content = plain_text(txn, text);
    let total = content.len() as u32;
    for offset in [index, end_of(index, len)] {
        check_index(path, offset, total)?;
        if !content.is_char_boundary(offset as usize) {
            return Err(CollabError::OutOfRange {
                path: path.to_vec(),
                index: offset,
                len: total,
            });
        }
    }
    Ok(())
}

fn insert_run(txn: &mut TransactionMut, text: &XmlTextRef, index: u32, chunk: &str, marks: &[Mark]) {
    if chunk.is_empty() {
        return;
    }
    if marks.is_empty() {
        text.insert(txn, index, chunk);
    } else {
        text.insert_with_attributes(txn, index, chunk, marks_to_attrs(marks));
    }
}

/// Write parsed HTML under `parent`, starting at child `index`.
/// Consecutive text nodes are merged into one run.
fn write_nodes(txn: &mut TransactionMut, parent: &Container, mut index: u32, nodes: &[HtmlNode]) {
    let mut i = 0;
    while i < nodes.len() {
        match &nodes[i] {
            HtmlNode::Element {
                tag,
                attributes,
                children,
            } => {
                let element = parent.insert_element(txn, index, tag);
                for (name, value) in attributes {
                    element.insert_attribute(txn, name.as_str(), value.clone());
                }
                write_nodes(txn, &Container::Element(element), 0, children);
                i += 1;
            }
            HtmlNode::Text { .. } => {
                let run = parent.insert_text(txn, index);
                let mut offset = 0u32;
                while let Some(HtmlNode::Text { text, marks }) = nodes.get(i) {
                    insert_run(txn, &run, offset, text, marks);
                    offset += text.len() as u32;
                    i += 1;
                }
            }
        }
        index += 1;
    }
}

// ───────────────────────────────────────────────────────────────────
// Rendering
// ───────────────────────────────────────────────────────────────────

fn render_children<T: ReadTxn>(txn: &T, container: &Container, out: &mut String) {
    for index in 0..container.len(txn) {
        match container.get(txn, index) {
            Some(XmlOut::Element(element)) => render_element(txn, &element, out),
            Some(XmlOut::Text(text)) => render_text(txn, &text, out),
            Some(XmlOut::Fragment(fragment)) => {
                render_children(txn, &Container::Root(fragment), out)
            }
            None => {}
        }
    }
}

fn render_element<T: ReadTxn>(txn: &T, element: &XmlElementRef, out: &mut String) {
    let tag = element.tag().to_string();
    if !html::is_valid_name(&tag) {
        render_children(txn, &Container::Element(element.clone()), out);
        return;
    }
    let mut attributes: Vec<(String, String)> = element
        .attributes(txn)
        .filter(|(name, _)| html::is_valid_name(name))
        .map(|(name, value)| (name.to_string(), value.to_string(txn)))
        .collect();
    attributes.sort();

    out.push('<');
    out.push_str(&tag);
    for (name, value) in &attributes {
        out.push_str(&format!(" {name}=\"{}\"", html::escape(value)));
    }
    out.push('>');

    if VOID_TAGS.contains(&tag.as_str()) {
        return;
    }
    render_children(txn, &Container::Element(element.clone()), out);
    out.push_str(&format!("</{tag}>"));
}

fn render_text<T: ReadTxn>(txn: &T, text: &XmlTextRef, out: &mut String) {
    for chunk in text.diff(txn, YChange::identity) {
        let marks: Vec<Mark> = chunk
            .attributes
            .as_ref()
            .map(|attrs| {
                let sorted: BTreeMap<&str, &Any> =
                    attrs.iter().map(|(k, v)| (k.as_ref(), v)).collect();
                sorted
                    .into_iter()
                    .filter(|(name, _)| html::is_valid_name(name))
                    .filter_map(|(name, value)| Mark::from_any(name, value))
                    .collect()
            })
            .unwrap_or_default();

        for mark in &marks {
            out.push('<');
            out.push_str(&mark.name);
            for (key, value) in mark.attributes.iter().filter(|(k, _)| html::is_valid_name(k)) {
                out.push_str(&format!(" {key}=\"{}\"", html::escape(value)));
            }
            out.push('>');
        }
        out.push_str(&html::escape_text(&chunk_string(txn, &chunk.insert)));
        for mark in marks.iter().rev() {
            out.push_str(&format!("</{}>", mark.name));
        }
    }
}

/// Client id for seed content, derived from the content itself so every tab
/// seeding the same HTML produces identical operations.
fn seed_client_id(content: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let hash = content
        .bytes()
        .fold(FNV_OFFSET, |acc, b| (acc ^ u64::from(b)).wrapping_mul(FNV_PRIME));
    // Keep within the u32 range used for ordinary client ids.
    (hash ^ (hash >> 32)) & 0xFFFF_FFFF
}

// ───────────────────────────────────────────────────────────────────
// Replica
// ───────────────────────────────────────────────────────────────────

/// The local copy of one room's shared document.
pub struct DocumentReplica {
    room: RoomId,
    doc: Doc,
    content: XmlFragmentRef,
    /// yrs transactions are not reentrant; every transaction is taken under
    /// this lock and observers run after it is released.
    txn_lock: Mutex<()>,
    observers: RwLock<BTreeMap<u64, Observer>>,
    next_observer: AtomicU64,
}

impl DocumentReplica {
    pub fn new(room: RoomId) -> Arc<Self> {
        let doc = Doc::new();
        let content = doc.get_or_insert_xml_fragment(CONTENT_ROOT);
        Arc::new(Self {
            room,
            doc,
            content,
            txn_lock: Mutex::new(()),
            observers: RwLock::new(BTreeMap::new()),
            next_observer: AtomicU64::new(0),
        })
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    /// Register an observer for every applied change, local or remote.
    pub fn observe<F>(self: &Arc<Self>, observer: F) -> ReplicaSubscription
    where
        F: Fn(&ReplicaEvent) + Send + Sync + 'static,
    {
        let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
        write(&self.observers).insert(id, Arc::new(observer));
        ReplicaSubscription {
            replica: Arc::downgrade(self),
            id,
        }
    }

    fn emit(&self, origin: Origin, delta: Arc<[u8]>) {
        let observers: Vec<Observer> = read(&self.observers).values().cloned().collect();
        let event = ReplicaEvent { origin, delta };
        for observer in observers {
            observer(&event);
        }
    }

    /// Apply an editor change as one transaction and broadcast its delta.
    ///
    /// Mutations are applied in order. The first invalid one stops the
    /// change and is returned as an error; anything applied before it is
    /// still committed and emitted.
    pub fn apply_local_change(&self, change: &[TreeMutation]) -> Result<(), CollabError> {
        if change.is_empty() {
            return Ok(());
        }

        let (delta, applied, outcome) = {
            let _guard = lock(&self.txn_lock);
            let mut txn = self.doc.transact_mut();
            let mut applied = 0usize;
            let mut outcome = Ok(());
            for mutation in change {
                if let Err(e) = self.apply_mutation(&mut txn, mutation) {
                    outcome = Err(e);
                    break;
                }
                applied += 1;
            }
            (txn.encode_update_v1(), applied, outcome)
        };

        if applied > 0 {
            log::trace!("{}: local change of {applied} mutations, {} byte delta", self.room, delta.len());
            self.emit(Origin::Local, delta.into());
        }
        outcome
    }

    fn apply_mutation(&self, txn: &mut TransactionMut, mutation: &TreeMutation) -> Result<(), CollabError> {
        match mutation {
            TreeMutation::InsertElement { parent, index, tag } => {
                check_name(tag)?;
                let container = container_at(&*txn, &self.content, parent)?;
                check_index(parent, *index, container.len(&*txn))?;
                container.insert_element(txn, *index, tag);
            }
            TreeMutation::InsertText {
                parent,
                index,
                text,
                marks,
            } => {
                check_marks(marks)?;
                let container = container_at(&*txn, &self.content, parent)?;
                check_index(parent, *index, container.len(&*txn))?;
                let run = container.insert_text(txn, *index);
                insert_run(txn, &run, 0, text, marks);
            }
            TreeMutation::EditText {
                text,
                index,
                insert,
                marks,
            } => {
                check_marks(marks)?;
                let run = text_at(&*txn, &self.content, text)?;
                check_text_range(&*txn, text, &run, *index, 0)?;
                insert_run(txn, &run, *index, insert, marks);
            }
            TreeMutation::DeleteText { text, index, len } => {
                let run = text_at(&*txn, &self.content, text)?;
                check_text_range(&*txn, text, &run, *index, *len)?;
                if *len > 0 {
                    run.remove_range(txn, *index, *len);
                }
            }
            TreeMutation::FormatText {
                text,
                index,
                len,
                set,
                clear,
            } => {
                check_marks(set)?;
                clear.iter().try_for_each(|name| check_name(name))?;
                let run = text_at(&*txn, &self.content, text)?;
                check_text_range(&*txn, text, &run, *index, *len)?;
                let mut attrs = marks_to_attrs(set);
                for name in clear {
                    attrs.insert(Arc::from(name.as_str()), Any::Null);
                }
                if *len > 0 && !attrs.is_empty() {
                    run.format(txn, *index, *len, attrs);
                }
            }
            TreeMutation::SetAttribute {
                element,
                name,
                value,
            } => {
                check_name(name)?;
                let node = element_at(&*txn, &self.content, element)?;
                node.insert_attribute(txn, name.as_str(), value.clone());
            }
            TreeMutation::RemoveAttribute { element, name } => {
                let node = element_at(&*txn, &self.content, element)?;
                node.remove_attribute(txn, name);
            }
            TreeMutation::RemoveNodes { parent, index, len } => {
                let container = container_at(&*txn, &self.content, parent)?;
                check_index(parent, end_of(*index, *len), container.len(&*txn))?;
                if *len > 0 {
                    container.remove_range(txn, *index, *len);
                }
            }
        }
        Ok(())
    }

    /// Merge a delta received from a peer.
    ///
    /// A delta that cannot be decoded is rejected without touching the tree.
    /// Re-applying a delta that was already merged is a no-op.
    pub fn apply_remote_delta(&self, delta: &[u8]) -> Result<(), CollabError> {
        if let Err(e) = validate::update_v1(delta) {
            log::warn!("{}: dropping malformed delta ({} bytes): {e}", self.room, delta.len());
            return Err(CollabError::MalformedDelta(e.to_string()));
        }
        let update = Update::decode_v1(delta).map_err(|e| {
            log::warn!("{}: dropping malformed delta ({} bytes): {e}", self.room, delta.len());
            CollabError::MalformedDelta(e.to_string())
        })?;

        {
            let _guard = lock(&self.txn_lock);
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update).map_err(|e| {
                log::warn!("{}: failed to merge delta: {e}", self.room);
                CollabError::Merge(e.to_string())
            })?;
        }

        self.emit(Origin::Remote, Arc::from(delta));
        Ok(())
    }

    /// Load initial editor content, but only into an empty replica.
    ///
    /// Returns whether the content was applied. The seeded delta is emitted
    /// as a local change so peers that are also empty receive it.
    pub fn seed_html(&self, content: &str) -> Result<bool, CollabError> {
        let nodes = html::parse(content)?;
        if nodes.is_empty() {
            return Ok(false);
        }

        let seed = Doc::with_client_id(seed_client_id(content).into());
        let seed_root = seed.get_or_insert_xml_fragment(CONTENT_ROOT);
        let update = {
            let mut txn = seed.transact_mut();
            write_nodes(&mut txn, &Container::Root(seed_root), 0, &nodes);
            txn.encode_update_v1()
        };

        {
            let _guard = lock(&self.txn_lock);
            let mut txn = self.doc.transact_mut();
            if self.content.len(&txn) > 0 {
                return Ok(false);
            }
            let decoded = Update::decode_v1(&update)
                .map_err(|e| CollabError::MalformedDelta(e.to_string()))?;
            txn.apply_update(decoded)
                .map_err(|e| CollabError::Merge(e.to_string()))?;
        }

        log::debug!("{}: seeded replica from {} bytes of HTML", self.room, content.len());
        self.emit(Origin::Local, update.into());
        Ok(true)
    }

    /// Whether the document tree has no content.
    pub fn is_empty(&self) -> bool {
        let _guard = lock(&self.txn_lock);
        self.content.len(&self.doc.transact()) == 0
    }

    /// Current tree rendered as HTML.
    pub fn to_html(&self) -> String {
        let _guard = lock(&self.txn_lock);
        let txn = self.doc.transact();
        let mut out = String::new();
        render_children(&txn, &Container::Root(self.content.clone()), &mut out);
        out
    }

    /// Encoded state vector: what this replica has seen, per client.
    pub fn state_vector(&self) -> Vec<u8> {
        let _guard = lock(&self.txn_lock);
        self.doc.transact().state_vector().encode_v1()
    }

    /// Delta containing everything this replica has that `state_vector` lacks.
    pub fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, CollabError> {
        let remote = decode_state_vector(state_vector)?;
        let _guard = lock(&self.txn_lock);
        Ok(self.doc.transact().encode_diff_v1(&remote))
    }

    /// The whole document as a single delta.
    pub fn encode_state(&self) -> Vec<u8> {
        let _guard = lock(&self.txn_lock);
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    /// Whether this replica holds operations the peer with `state_vector`
    /// has not seen.
    pub fn is_ahead_of(&self, state_vector: &[u8]) -> Result<bool, CollabError> {
        let remote = decode_state_vector(state_vector)?;
        let local = self.local_state_vector();
        Ok(local.iter().any(|(client, &clock)| remote.get(client) < clock))
    }

    /// Whether the peer with `state_vector` holds operations this replica
    /// has not seen.
    pub fn is_behind(&self, state_vector: &[u8]) -> Result<bool, CollabError> {
        let remote = decode_state_vector(state_vector)?;
        let local = self.local_state_vector();
        Ok(remote.iter().any(|(client, &clock)| local.get(client) < clock))
    }

    fn local_state_vector(&self) -> StateVector {
        let _guard = lock(&self.txn_lock);
        self.doc.transact().state_vector()
    }
}

fn decode_state_vector(bytes: &[u8]) -> Result<StateVector, CollabError> {
    validate::state_vector_v1(bytes).map_err(|e| CollabError::MalformedStateVector(e.to_string()))?;
    StateVector::decode_v1(bytes).map_err(|e| CollabError::MalformedStateVector(e.to_string()))
}
