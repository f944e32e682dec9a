//! Signature-carving extraction engine for packed game-archive containers.
//!
//! A carving run scans a source for known format signatures, validates each
//! candidate, resolves its end boundary with the format's strategy, and
//! writes every confirmed segment out as a standalone file. Batches fan the
//! same procedure out over a worker pool with shared output naming.

pub mod batch;
pub mod decoder;
pub mod descriptor;
pub mod error;
pub mod io;
pub mod naming;
pub mod report;
pub mod resolver;
pub mod scanner;
pub mod session;
pub mod types;
pub mod validator;

pub use batch::{BatchConfig, BatchCoordinator, BatchEvent, BatchOutcome, BatchSummary};
pub use descriptor::{builtin_descriptors, BoundaryStrategy, FormatDescriptor, ValidationRule};
pub use error::{CarveError, Result};
pub use naming::NameRegistry;
pub use session::CarvingSession;
pub use types::{Candidate, ExtractionRecord, Segment, SessionStats, Signature};
