//! Editor integration: bridges a rich-text editor instance with a room
//! session.
//!
//! ## Data flow
//!
//! ```text
//!  editor transaction ──► EditorAdapter::apply_transaction() ──► replica ──► peers
//!  editor selection   ──► EditorAdapter::set_selection()     ──► awareness (throttled)
//!  peer delta ──► replica ──► on_change(html) ──► editor re-render
//!  peer awareness ──► EditorAdapter::remote_cursors() ──► cursor decorations
//! ```

use std::sync::Arc;

use uuid::Uuid;

use crate::awareness::CursorRange;
use crate::error::CollabError;
use crate::replica::{ReplicaSubscription, TreeMutation};
use crate::session::RoomSession;

/// What the editor needs to draw one remote caret or selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorDecoration {
    pub client_id: Uuid,
    pub user_name: String,
    pub color: String,
    pub anchor: u32,
    pub head: u32,
}

/// Binds one editor instance to one [`RoomSession`].
pub struct EditorAdapter {
    session: Arc<RoomSession>,
    _render: ReplicaSubscription,
}

impl EditorAdapter {
    /// Attach an editor showing `content_html`.
    ///
    /// An empty replica is seeded from `content_html`. Afterwards
    /// `on_change` receives the rendered document after every applied
    /// change, local or remote.
    pub fn new<F>(session: Arc<RoomSession>, content_html: &str, on_change: F) -> Result<Self, CollabError>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        if !content_html.trim().is_empty() && session.replica().seed_html(content_html)? {
            log::debug!("{}: seeded from editor content", session.room());
        }

        let replica = Arc::downgrade(session.replica());
        let render = session.replica().observe(move |_event| {
            if let Some(replica) = replica.upgrade() {
                on_change(&replica.to_html());
            }
        });

        let presence = session.awareness(|a| a.local_update());
        session.broadcast_awareness(presence);

        Ok(Self {
            session,
            _render: render,
        })
    }

    pub fn session(&self) -> &Arc<RoomSession> {
        &self.session
    }

    /// Apply one editor transaction to the shared document.
    pub fn apply_transaction(&self, mutations: &[TreeMutation]) -> Result<(), CollabError> {
        self.session.replica().apply_local_change(mutations)
    }

    /// Publish the local selection. Returns whether it was sent now.
    ///
    /// A throttled selection is sent once the throttle interval ends, by a
    /// timer on the current tokio runtime. Without a runtime it waits for
    /// [`flush`](Self::flush).
    pub fn set_selection(&self, anchor: u32, head: u32) -> bool {
        self.publish_cursor(Some(CursorRange { anchor, head }))
    }

    /// The editor lost focus.
    pub fn clear_selection(&self) -> bool {
        self.publish_cursor(None)
    }

    fn publish_cursor(&self, cursor: Option<CursorRange>) -> bool {
        let (entry, timer_running) = self.session.awareness(|a| {
            let timer_running = a.has_pending();
            (a.set_local_cursor(cursor), timer_running)
        });
        match entry {
            Some(entry) => self.session.broadcast_awareness(entry),
            None => {
                if !timer_running {
                    self.schedule_flush();
                }
                false
            }
        }
    }

    /// Send the pending selection when the throttle interval ends.
    fn schedule_flush(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let delay = self.session.awareness(|a| a.throttle_remaining());
        let session = Arc::downgrade(&self.session);
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(session) = session.upgrade() {
                if let Some(entry) = session.awareness(|a| a.take_pending()) {
                    session.broadcast_awareness(entry);
                }
            }
        });
    }

    /// Send a throttled selection that has not gone out yet.
    pub fn flush(&self) -> bool {
        match self.session.awareness(|a| a.take_pending()) {
            Some(entry) => self.session.broadcast_awareness(entry),
            None => false,
        }
    }

    /// Change the displayed user name.
    pub fn set_user_name(&self, name: &str) -> bool {
        let entry = self.session.awareness(|a| a.set_local_user(name));
        self.session.broadcast_awareness(entry)
    }

    /// Decorations for every remote client with a cursor.
    pub fn remote_cursors(&self) -> Vec<CursorDecoration> {
        self.session.awareness(|a| {
            a.remote_states()
                .into_iter()
                .filter_map(|p| {
                    let cursor = p.state.cursor?;
                    Some(CursorDecoration {
                        client_id: p.client_id,
                        user_name: p.state.user_name.clone(),
                        color: p.state.color.clone(),
                        anchor: cursor.anchor,
                        head: cursor.head,
                    })
                })
                .collect()
        })
    }

    /// Current document rendering.
    pub fn html(&self) -> String {
        self.session.replica().to_html()
    }
}
