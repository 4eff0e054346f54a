//! Shared domain types for the habot control bridge
//!
//! This crate defines the vocabulary every other crate speaks: entity
//! identifiers, entity state values, user action descriptors, and the
//! per-domain attribute/state classification tables.

pub mod action;
pub mod entity_id;
pub mod mapping;
pub mod state;

pub use action::{ActionKey, ActionRequest, CallbackId, Gesture, UserId};
pub use entity_id::{EntityId, EntityIdError};
pub use mapping::{key_attributes, map_state, MappedState};
pub use state::EntityState;
