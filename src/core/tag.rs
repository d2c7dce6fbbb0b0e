//! Purpose: Issue correlation tokens that link completion events back to call objects.
//! Exports: `CallId`, `TagLabel`, `Tag`, `Tagger`.
//! Role: Replaces raw object addresses with stable integer ids carried by the transport.
//! Invariants: A `CallId` is never reissued by the same `Tagger`.
//! Invariants: The connectivity notification path uses no tag at all (`Option<Tag>::None`).
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct CallId(u64);

impl CallId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Event kind a tag was issued for.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TagLabel {
    /// Server: an incoming call was matched to a listener.
    NewCall,
    /// An outstanding read/write/open completed.
    OperationComplete,
    /// Terminal: no further events follow for this call.
    Done,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Tag {
    pub call: CallId,
    pub label: TagLabel,
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}", self.call, self.label)
    }
}

#[derive(Debug, Default)]
pub struct Tagger {
    next: u64,
}

impl Tagger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a fresh call id; ids start at 1.
    pub fn next_call(&mut self) -> CallId {
        self.next += 1;
        CallId(self.next)
    }

    pub fn make_tag(&self, call: CallId, label: TagLabel) -> Tag {
        Tag { call, label }
    }
}
