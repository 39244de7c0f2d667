//! Rejoin tracking.
//!
//! Log servers of the epochs being recovered announce themselves to the
//! coordinator when they (re)start. The tracker binds each announcement into
//! the handle slot with the matching uid and owes every announcer a decision:
//! `false` means "keep serving, a newer announcement superseded you is
//! coming" and is sent whenever the same server announces again; `true`
//! means "you are not part of any known epoch, stop" and is also the
//! terminal answer flushed to all pending announcers on shutdown.

use std::collections::HashMap;

use taglog_types::Uid;
use tracing::info;

use crate::events::{Actions, RejoinToken};
use crate::handle::LogServerHandle;
use crate::message::{OptionalInterface, TLogRejoinRequest};

// ============================================================================
// Rejoin Tracker
// ============================================================================

/// Absorbs rejoin announcements for a set of handles.
#[derive(Debug)]
pub struct RejoinTracker {
    dbgid: Uid,
    handles: Vec<LogServerHandle>,
    last_reply: HashMap<Uid, RejoinToken>,
}

impl RejoinTracker {
    /// Creates a tracker over every handle rejoins may bind into: current
    /// and historical.
    pub fn new(dbgid: Uid, handles: Vec<LogServerHandle>) -> Self {
        Self {
            dbgid,
            handles,
            last_reply: HashMap::new(),
        }
    }

    /// Processes one announcement; returns the slot index it bound to.
    pub fn handle(&mut self, request: TLogRejoinRequest, actions: &mut Actions) -> Option<usize> {
        let id = request.interface.id;
        let position = self.handles.iter().position(|handle| handle.id() == id);

        let Some(position) = position else {
            info!(dbgid = %self.dbgid, server = %id, "rejoin from unknown log server");
            actions.rejoin_replies.push((request.reply, true));
            return None;
        };

        info!(
            dbgid = %self.dbgid,
            server = %id,
            address = %request.interface.address,
            "log server rejoined"
        );

        self.handles[position].set_if_changed(OptionalInterface::known(request.interface));

        if let Some(previous) = self.last_reply.insert(id, request.reply) {
            actions.rejoin_replies.push((previous, false));
        }
        Some(position)
    }

    /// Terminates the tracker, answering every pending announcer with `true`.
    pub fn shutdown(self) -> Actions {
        let mut actions = Actions::empty();
        for (_, token) in self.last_reply {
            actions.rejoin_replies.push((token, true));
        }
        actions
    }
}
