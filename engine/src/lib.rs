//! # Tributary Engine
//!
//! Deterministic routing and translation of document changes into a
//! transaction-bracketed replication protocol.
//!
//! This crate holds everything that does not touch a socket or a database:
//! document evaluation, table routing, change translation, the wire format
//! and the watermark encoding. The same inputs always produce the same
//! outputs.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never reads a change stream or writes a socket
//! - **Fail closed**: unsupported operators make a rule match nothing
//! - **Ordered**: every source change maps to one bracket of messages
//!
//! ## Core Concepts
//!
//! ### Routing
//!
//! A [`RoutingRule`] defines a logical table over a source collection, with
//! an optional filter and either a projection or a [`Pipeline`]. The
//! [`TableRouter`] evaluates all rules of a collection, so one document can
//! fan out into several tables.
//!
//! ### Translation
//!
//! [`TableRouter::route_change`] turns one raw [`ChangeEvent`] into per-table
//! events, and the [`ChangeTranslator`] turns those into [`ChangeMessage`]
//! frames. A replace becomes a delete and an insert inside one bracket.
//!
//! ### Watermarks
//!
//! A [`Watermark`] is a length-prefixed base-36 encoding of a shard-local
//! LSN. String order equals LSN order, so subscribers compare positions
//! without decoding them.
//!
//! ## Quick Start
//!
//! ```rust
//! use tributary_engine::{
//!     ChangeEvent, ChangeTranslator, Namespace, ResumePosition, RoutingRule,
//!     TableRouter, Watermark,
//! };
//! use serde_json::json;
//!
//! // 1. Split one collection into two logical tables
//! let router = TableRouter::new(vec![
//!     RoutingRule::new("direct_rooms", "rooms").with_filter(json!({"t": "d"})),
//!     RoutingRule::new("private_rooms", "rooms")
//!         .with_filter(json!({"t": "p"}))
//!         .with_projection(json!({"name": 1})),
//! ])
//! .unwrap();
//!
//! // 2. Route a raw change
//! let doc = json!({"_id": "r1", "t": "d", "name": "general"});
//! let event = ChangeEvent::insert(
//!     Namespace::new("chat", "rooms"),
//!     doc.as_object().cloned().unwrap(),
//! )
//! .at(ResumePosition::new("17"));
//! let routed = router.route_change(&event).unwrap();
//! assert_eq!(routed.len(), 1);
//! assert_eq!(routed[0].namespace.coll, "direct_rooms");
//!
//! // 3. Bracket it under a watermark
//! let wm = Watermark::from_lsn(1);
//! let messages = ChangeTranslator::new().transaction(&wm, &routed).unwrap();
//! let frames: Vec<_> = messages
//!     .iter()
//!     .map(|m| serde_json::to_value(m).unwrap()[0].clone())
//!     .collect();
//! assert_eq!(frames, vec![json!("begin"), json!("data"), json!("commit")]);
//! ```

pub mod change;
pub mod diff;
pub mod document;
pub mod error;
pub mod expression;
pub mod filter;
pub mod mutation;
pub mod pipeline;
pub mod projection;
pub mod protocol;
pub mod router;
pub mod translate;
pub mod watermark;

// Re-export main types at crate root
pub use change::{ChangeEvent, ChangeKind, Namespace, ResumePosition};
pub use diff::{diff_arrays, ArrayDiff, Modified};
pub use document::Document;
pub use error::{Error, Result};
pub use mutation::{
    Mutation, MutationErrorKind, MutationId, MutationResponse, MutationResult, MutationType,
    PushRequest, PushResponse,
};
pub use pipeline::{Pipeline, Stage};
pub use projection::Projection;
pub use protocol::{ChangeMessage, DataChange, IndexSpec, Relation, SubscriberMessage, TableId};
pub use router::{RoutedDocument, RoutingRule, TableRouter};
pub use translate::ChangeTranslator;
pub use watermark::{Watermark, BASE_LSN, INITIAL_SYNC};

/// Type aliases for clarity
pub type ShardId = String;
pub type TableName = String;
