use thiserror::Error;

use crate::types::EntityId;

/// Result alias used across the public API.
pub type PhysResult<T> = Result<T, PhysError>;

/// Errors surfaced at the API boundary.
///
/// Only invalid caller input and configuration problems are reported this way.
/// Resource exhaustion and numeric trouble inside a tick degrade with a logged
/// warning instead, and step contention is absorbed by the request queue.
#[derive(Debug, Error)]
pub enum PhysError {
    #[error("unknown entity {0}")]
    UnknownEntity(EntityId),

    #[error("entity {0} is pending deletion")]
    EntityDeleted(EntityId),

    #[error("entity {entity} has no joint {index}")]
    InvalidJoint { entity: EntityId, index: usize },

    #[error("entity {entity} has no part {index}")]
    InvalidPart { entity: EntityId, index: usize },

    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("non-finite value in `{0}`")]
    NonFinite(&'static str),

    #[error("operation not supported by this entity kind: {0}")]
    Unsupported(&'static str),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config io error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("failed to start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl PhysError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        PhysError::InvalidParameter { name, reason: reason.into() }
    }
}

/// Reject non-finite vectors at the API boundary.
pub(crate) fn ensure_finite_vec(name: &'static str, v: glam::Vec3) -> PhysResult<()> {
    if v.is_finite() { Ok(()) } else { Err(PhysError::NonFinite(name)) }
}

pub(crate) fn ensure_finite(name: &'static str, v: f32) -> PhysResult<()> {
    if v.is_finite() { Ok(()) } else { Err(PhysError::NonFinite(name)) }
}
