//! Typed change requests and the queue that defers them past a running step.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use glam::Vec3;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::entity::SimParams;
use crate::error::{ensure_finite_vec, PhysError, PhysResult};
use crate::geometry::Pose;
use crate::joint::JointParams;
use crate::snapshot::EntitySnapshot;
use crate::types::{EntityId, MaterialId};

/// Parameter blocks accepted by `set_params`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntityParams {
    Pose(Pose),
    Velocity { linear: Vec3, angular: Vec3 },
    Simulation(SimParams),
    Joint { index: usize, params: JointParams },
    Material { part: usize, material: MaterialId },
    /// Continuous force from an external buoyancy provider; zero clears it.
    Buoyancy(Vec3),
}

impl EntityParams {
    pub fn validate(&self) -> PhysResult<()> {
        match self {
            EntityParams::Pose(p) if !p.is_finite() => Err(PhysError::NonFinite("pose")),
            EntityParams::Velocity { linear, angular } => {
                ensure_finite_vec("linear velocity", *linear)?;
                ensure_finite_vec("angular velocity", *angular)
            }
            EntityParams::Simulation(sim) => sim.validate(),
            EntityParams::Joint { params, .. } => params.validate(),
            EntityParams::Buoyancy(f) => ensure_finite_vec("buoyancy", *f),
            _ => Ok(()),
        }
    }

    /// Whether applying the block should wake a sleeping entity.
    pub fn wakes(&self) -> bool {
        !matches!(self, EntityParams::Material { .. })
    }
}

/// One-shot requests accepted by `action`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Action {
    /// Linear impulse at a world point (center of mass when `None`) plus an
    /// angular impulse. `body` selects the joint body of an articulated entity.
    Impulse { impulse: Vec3, point: Option<Vec3>, angular: Vec3, body: u16 },
    SetVelocity { linear: Vec3, angular: Vec3 },
    /// Hold joint rates until replaced; `None` releases the drive.
    DriveJoint { joint: usize, rates: Option<Vec3> },
    /// Stop all motion.
    Reset,
    Wake,
    /// Point constraint to another entity (or the world when `other` is
    /// `None`). Pivots are in each side's entity frame; a world pivot is a
    /// world point. A zero `max_impulse` never breaks.
    AddConstraint {
        id: u32,
        other: Option<EntityId>,
        pivot: Vec3,
        other_pivot: Vec3,
        max_impulse: f32,
    },
    RemoveConstraint { id: u32 },
}

impl Action {
    pub fn impulse(impulse: Vec3) -> Self {
        Action::Impulse { impulse, point: None, angular: Vec3::ZERO, body: 0 }
    }

    pub fn impulse_at(impulse: Vec3, point: Vec3) -> Self {
        Action::Impulse { impulse, point: Some(point), angular: Vec3::ZERO, body: 0 }
    }

    pub fn validate(&self) -> PhysResult<()> {
        match self {
            Action::Impulse { impulse, point, angular, .. } => {
                ensure_finite_vec("impulse", *impulse)?;
                ensure_finite_vec("angular impulse", *angular)?;
                ensure_finite_vec("impulse point", point.unwrap_or(Vec3::ZERO))
            }
            Action::SetVelocity { linear, angular } => {
                ensure_finite_vec("linear velocity", *linear)?;
                ensure_finite_vec("angular velocity", *angular)
            }
            Action::DriveJoint { rates, .. } => {
                ensure_finite_vec("drive rates", rates.unwrap_or(Vec3::ZERO))
            }
            Action::AddConstraint { pivot, other_pivot, max_impulse, .. } => {
                ensure_finite_vec("pivot", *pivot)?;
                ensure_finite_vec("other pivot", *other_pivot)?;
                if !(max_impulse.is_finite() && *max_impulse >= 0.0) {
                    let reason = "must be finite and non-negative";
                    return Err(PhysError::invalid("max_impulse", reason));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn wakes(&self) -> bool {
        !matches!(self, Action::RemoveConstraint { .. })
    }
}

/// A request deferred until the running step ends.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    SetParams(EntityId, EntityParams),
    Action(EntityId, Action),
    Restore(EntityId, Box<EntitySnapshot>),
    Destroy(EntityId),
}

impl Command {
    pub fn entity(&self) -> EntityId {
        match self {
            Command::SetParams(id, _)
            | Command::Action(id, _)
            | Command::Restore(id, _)
            | Command::Destroy(id) => *id,
        }
    }
}

/// Bounded FIFO of deferred commands. A full queue drops the request with a
/// warning; submission order is kept for everything accepted.
pub struct CommandQueue {
    tx: Sender<Command>,
    rx: Receiver<Command>,
    dropped: AtomicUsize,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self { tx, rx, dropped: AtomicUsize::new(0) }
    }

    /// Returns false if the request was dropped.
    pub fn push(&self, cmd: Command) -> bool {
        match self.tx.try_send(cmd) {
            Ok(()) => true,
            Err(TrySendError::Full(cmd)) => {
                let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(entity = cmd.entity(), dropped = n, "command queue full; request dropped");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Take everything queued so far, oldest first.
    pub fn drain(&self) -> Vec<Command> {
        self.rx.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_keeps_order_and_drops_when_full() {
        let q = CommandQueue::new(2);
        assert!(q.push(Command::Action(1, Action::Wake)));
        assert!(q.push(Command::Destroy(2)));
        assert!(!q.push(Command::Action(3, Action::Reset)));
        assert_eq!(q.len(), 2);
        assert_eq!(q.dropped(), 1);
        assert_eq!(q.drain(), vec![Command::Action(1, Action::Wake), Command::Destroy(2)]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_validation_rejects_non_finite() {
        assert!(Action::impulse(Vec3::new(f32::NAN, 0.0, 0.0)).validate().is_err());
        let negative = Action::AddConstraint {
            id: 1,
            other: None,
            pivot: Vec3::ZERO,
            other_pivot: Vec3::ZERO,
            max_impulse: -1.0,
        };
        assert!(negative.validate().is_err());
        let spin = EntityParams::Velocity { linear: Vec3::ZERO, angular: Vec3::INFINITY };
        assert!(spin.validate().is_err());
        let sim = SimParams { damping: -1.0, ..SimParams::default() };
        assert!(EntityParams::Simulation(sim).validate().is_err());
        assert!(EntityParams::Material { part: 0, material: 3 }.validate().is_ok());
        assert!(!EntityParams::Material { part: 0, material: 3 }.wakes());
    }
}
