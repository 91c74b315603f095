//! The spell modification engine.
//!
//! [`MagicBuilder`] accumulates a conflict-resolved modification set for one
//! spell. The set goes one of two ways: to the [`CastingEngine`] for an
//! immediate cast whose live execution the [`MagicProcessor`] rewrites on
//! the fly, or to the [`MagicWriter`] for a persistent patch of the spell's
//! definition file that re-applies on every load.

pub mod builder;
pub mod casting;
pub mod entry;
pub mod file;
pub mod model;
pub mod processor;
pub mod writer;

pub use builder::MagicBuilder;
pub use casting::{
    ActorHandle, ActorPort, ActorRef, CastError, CastOptions, CastPort, CastingEngine,
    SourceSelector, TargetSelector,
};
pub use entry::{translate, MagicModEntry};
pub use file::{MagicFile, MagicFileError, PropertyValue};
pub use model::{
    GroupId, ImportError, MagicId, ModKind, ModValue, Modification, ModificationDoc, OpTypeId,
    PropertyId, PropertyTypeTable, ValueKind, ANY,
};
pub use processor::MagicProcessor;
pub use writer::{MagicWriter, RegistrationHandle, ResourceHandle, ResourcePort, RetryPolicy};
