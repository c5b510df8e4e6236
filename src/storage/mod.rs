//! Storage backends.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Storage Module                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │  traits.rs     - Store capability contract                   │
//! │  └─ Store: write / read / snapshot / restore (+ search)      │
//! │  └─ Snapshot: opaque, store-defined state capture            │
//! ├──────────────────────────────────────────────────────────────┤
//! │  memory.rs     - In-process reference adapter                │
//! ├──────────────────────────────────────────────────────────────┤
//! │  resilient.rs  - Circuit breaker + retry decorator           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Concrete drivers (document, columnar, graph, vector, object storage)
//! live outside this crate and only need to implement [`traits::Store`].

pub mod traits;
pub mod memory;
pub mod resilient;
