//! Job lifecycle events.
//!
//! Every status change is described by an event; the event decides the
//! target status, the terminal error, and the single log entry that records
//! the cause of the transition.

pub mod job;
