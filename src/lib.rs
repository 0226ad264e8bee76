//! kinetik: multi-threaded rigid and articulated body physics in 3D, with a
//! broad-phase grid over XY and Z compressed per cell.

pub mod api;
pub mod articulated;
pub mod body;
pub mod broadphase;
pub mod commands;
pub mod config;
pub mod contact;
pub mod entity;
pub mod error;
pub mod geometry;
pub mod grid;
pub mod island;
pub mod joint;
pub mod logging;
pub mod math;
pub mod narrowphase;
pub mod rigid;
pub mod scheduler;
pub mod snapshot;
pub mod solver;
pub mod spatial;
pub mod types;
pub mod world;

pub use crate::api::*;
pub use crate::articulated::RootMode;
pub use crate::broadphase::{RayFlags, RayQuery};
pub use crate::commands::{Action, EntityParams};
pub use crate::config::*;
pub use crate::entity::{EntityDesc, EntityKind, EntityStatus, JointStatus, SimParams};
pub use crate::error::{PhysError, PhysResult};
pub use crate::geometry::{Part, PartFlags, Pose, Shape};
pub use crate::joint::{JointDesc, JointFlags, JointParams};
pub use crate::snapshot::EntitySnapshot;
pub use crate::types::*;
pub use crate::world::PhysicsWorld;
