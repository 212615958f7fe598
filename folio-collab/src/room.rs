//! Room identity.
//!
//! A room is the unit of replication: one replica, one relay group and one
//! awareness set. Its name is derived from the document and the section (or
//! subsection) being edited, so every client that opens the same region of
//! the same document lands in the same room.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CollabError;

/// Opaque, deterministic room name such as `doc123-summary_table`.
///
/// Components are joined with `-`. A `-` or `%` inside a component is
/// percent-encoded, so distinct (document, section, subsection) triples
/// never share a name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Room for a whole section: `{document_id}-{section_key}`.
    pub fn for_section(document_id: &str, section_key: &str) -> Result<Self, CollabError> {
        check_component("document id", document_id)?;
        check_component("section key", section_key)?;
        Ok(Self(format!("{}-{}", encode(document_id), encode(section_key))))
    }

    /// Room for a subsection: `{document_id}-{section_key}-{subsection_key}`.
    pub fn for_subsection(
        document_id: &str,
        section_key: &str,
        subsection_key: &str,
    ) -> Result<Self, CollabError> {
        check_component("document id", document_id)?;
        check_component("section key", section_key)?;
        check_component("subsection key", subsection_key)?;
        Ok(Self(format!(
            "{}-{}-{}",
            encode(document_id),
            encode(section_key),
            encode(subsection_key)
        )))
    }

    /// Wrap an already-derived room name (as received on the wire).
    pub fn from_name(name: impl Into<String>) -> Result<Self, CollabError> {
        let name = name.into();
        check_component("room name", &name)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn check_component(what: &str, value: &str) -> Result<(), CollabError> {
    if value.trim().is_empty() {
        return Err(CollabError::InvalidRoom(format!("{what} must not be empty")));
    }
    Ok(())
}

fn encode(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for c in component.chars() {
        match c {
            '%' => out.push_str("%25"),
            '-' => out.push_str("%2D"),
            c => out.push(c),
        }
    }
    out
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RoomId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
