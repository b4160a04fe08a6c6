//! Filter and match callback lists.
//!
//! Both lists may be mutated from inside their own callbacks. Mutation
//! flips a `modified` flag which makes the running scan restart, and every
//! entry is stamped with the dispatch iteration it last ran in so a
//! restart never delivers the same message to the same callback twice.

use std::rc::Rc;

use crate::connection::Connection;
use crate::error::Result;
use crate::message::Message;

/// A callback receiving inbound messages. Returning `true` consumes the
/// message and stops the pipeline.
pub(crate) type MessageHandler = Rc<dyn Fn(&mut Connection, &Message) -> Result<bool>>;

/// A reply callback, invoked once with the reply or a synthesized timeout
/// error.
pub(crate) type ReplyHandler = Box<dyn FnOnce(&mut Connection, &Message) -> Result<()>>;

/// A predicate deciding whether a match callback sees a message. The
/// expression language and its parser live outside this crate; the
/// connection only runs the compiled predicate.
pub(crate) type MatchPredicate = Rc<dyn Fn(&Message) -> bool>;

/// Identifies a registered filter for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterHandle(u64);

/// Identifies a registered match for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchHandle(u64);

pub(crate) struct FilterEntry {
    id: u64,
    callback: MessageHandler,
    last_iteration: u64,
}

pub(crate) struct FilterList {
    entries: Vec<FilterEntry>,
    modified: bool,
    next_id: u64,
}

impl FilterList {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            modified: false,
            next_id: 1,
        }
    }

    pub(crate) fn add(&mut self, callback: MessageHandler) -> FilterHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.modified = true;

        // New filters run first, like a prepended list node.
        self.entries.insert(
            0,
            FilterEntry {
                id,
                callback,
                last_iteration: 0,
            },
        );

        FilterHandle(id)
    }

    pub(crate) fn remove(&mut self, handle: FilterHandle) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != handle.0);

        if self.entries.len() != before {
            self.modified = true;
            true
        } else {
            false
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn begin_scan(&mut self) {
        self.modified = false;
    }

    pub(crate) fn is_modified(&self) -> bool {
        self.modified
    }

    /// Stamp the entry at `index` with the current iteration and hand out
    /// its callback, or `None` if it already ran this iteration.
    pub(crate) fn stamp(&mut self, index: usize, iteration: u64) -> Option<MessageHandler> {
        let entry = &mut self.entries[index];

        if entry.last_iteration == iteration {
            return None;
        }

        entry.last_iteration = iteration;
        Some(Rc::clone(&entry.callback))
    }
}

pub(crate) struct MatchEntry {
    id: u64,
    predicate: MatchPredicate,
    callback: MessageHandler,
    last_iteration: u64,
}

pub(crate) struct MatchList {
    entries: Vec<MatchEntry>,
    modified: bool,
    next_id: u64,
}

impl MatchList {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            modified: false,
            next_id: 1,
        }
    }

    pub(crate) fn add(
        &mut self,
        predicate: MatchPredicate,
        callback: MessageHandler,
    ) -> MatchHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.modified = true;

        self.entries.push(MatchEntry {
            id,
            predicate,
            callback,
            last_iteration: 0,
        });

        MatchHandle(id)
    }

    pub(crate) fn remove(&mut self, handle: MatchHandle) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != handle.0);

        if self.entries.len() != before {
            self.modified = true;
            true
        } else {
            false
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn begin_scan(&mut self) {
        self.modified = false;
    }

    pub(crate) fn is_modified(&self) -> bool {
        self.modified
    }

    /// Stamp and hand out the callback at `index` if its predicate accepts
    /// the message and it has not run this iteration.
    pub(crate) fn stamp(
        &mut self,
        index: usize,
        iteration: u64,
        m: &Message,
    ) -> Option<MessageHandler> {
        let entry = &mut self.entries[index];

        if entry.last_iteration == iteration {
            return None;
        }

        if !(entry.predicate)(m) {
            return None;
        }

        entry.last_iteration = iteration;
        Some(Rc::clone(&entry.callback))
    }
}
