//! Intrusive lock-free building blocks.
//!
//! These structures never allocate: the links live inside the user's node
//! type. A node may be linked into at most one list at a time and must
//! outlive its linkage.
//!
//! | Structure | Shape | Used by |
//! |-----------|-------|---------|
//! | [`IntrusiveStack`] | LIFO, CAS push/pop | RCU snapshot-record free list |
//! | [`IntrusiveMpscQueue`] | FIFO, many producers one consumer | [`crate::mpsc::MpscQueue`] |
//! | [`StripedReadIndicator`] | sharded reader counter | RCU snapshot reclamation |

mod indicator;
mod mpsc;
mod stack;

pub(crate) use indicator::{ReadIndicatorLock, StripedReadIndicator};
pub(crate) use mpsc::{IntrusiveMpscQueue, MpscHook};
pub(crate) use stack::{FreeListNode, IntrusiveStack};
