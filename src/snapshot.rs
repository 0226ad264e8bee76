use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::entity::{Dynamics, Entity};
use crate::error::{PhysError, PhysResult};
use crate::geometry::Pose;
use crate::joint::JointFlags;
use crate::types::{EntityId, SimClass};

/// Saved state of one joint.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JointSnapshot {
    pub q_rel: Quat,
    pub q_dot: Vec3,
    pub flags: JointFlags,
}

/// Serializable dynamic state of one entity. Geometry and parameters are not
/// included; restore targets an entity created from the same descriptor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub id: EntityId,
    pub pose: Pose,
    pub velocity: Vec3,
    pub angular_velocity: Vec3,
    pub sleeping: bool,
    #[serde(default)]
    pub joints: Vec<JointSnapshot>,
}

impl EntitySnapshot {
    pub fn capture(entity: &Entity) -> Self {
        let joints = entity
            .articulated()
            .map(|a| {
                a.joints
                    .iter()
                    .map(|j| JointSnapshot { q_rel: j.q_rel, q_dot: j.q_dot, flags: j.flags })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            id: entity.id,
            pose: entity.pose,
            velocity: entity.linear_velocity(),
            angular_velocity: entity.angular_velocity(),
            sleeping: entity.class == SimClass::Sleeping,
            joints,
        }
    }

    /// Write the saved state back. The caller repositions the grid thunk and
    /// handles class changes.
    pub fn apply(&self, entity: &mut Entity) -> PhysResult<()> {
        if !self.pose.is_finite()
            || !self.velocity.is_finite()
            || !self.angular_velocity.is_finite()
        {
            return Err(PhysError::NonFinite("snapshot"));
        }
        match &mut entity.dynamics {
            Dynamics::Articulated(a) => {
                if self.joints.len() != a.len() {
                    let reason = format!("expected {} joints", a.len());
                    return Err(PhysError::invalid("snapshot.joints", reason));
                }
                for (i, j) in self.joints.iter().enumerate() {
                    if !j.q_rel.is_finite() || !j.q_dot.is_finite() {
                        return Err(PhysError::NonFinite("snapshot joint"));
                    }
                    a.set_joint_state(i, j.q_rel, j.q_dot, j.flags);
                }
            }
            _ if !self.joints.is_empty() => {
                return Err(PhysError::invalid("snapshot.joints", "entity has no joints"));
            }
            _ => {}
        }
        entity.set_pose(&self.pose);
        if entity.is_dynamic() {
            // grounded trees carry no root velocity
            let _ = entity.set_velocity(self.velocity, self.angular_velocity);
        }
        entity.sync_pose();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::articulated::RootMode;
    use crate::entity::EntityDesc;
    use crate::geometry::{Part, Shape};
    use crate::joint::{JointDesc, JointParams};

    fn arm() -> EntityDesc {
        let joints = vec![JointDesc::new(None, Vec3::ZERO).with_params(JointParams::hinge(0))];
        let parts = vec![Part::new(Shape::Sphere { radius: 0.2 }, 1.0)
            .with_local(Pose::from_position(Vec3::Y))
            .on_joint(0)];
        EntityDesc::articulated(Pose::IDENTITY, parts, joints, RootMode::Fixed)
    }

    #[test]
    fn test_joint_state_survives_toml() {
        let mut e = Entity::new(1, &arm()).unwrap();
        if let Some(a) = e.articulated_mut() {
            let q = Quat::from_rotation_x(0.4);
            a.set_joint_state(0, q, Vec3::new(1.5, 0.0, 0.0), JointFlags::empty());
            a.refresh(None, None);
        }
        e.sync_pose();
        let snap = EntitySnapshot::capture(&e);
        let text = toml::to_string(&snap).unwrap();
        let back: EntitySnapshot = toml::from_str(&text).unwrap();

        let mut fresh = Entity::new(1, &arm()).unwrap();
        back.apply(&mut fresh).unwrap();
        let j = &fresh.articulated().unwrap().joints[0];
        assert!((j.angles.x - 0.4).abs() < 1e-5);
        assert_eq!(j.q_dot.x, 1.5);
        let tip = fresh.part_pose(0).position;
        assert!((tip - Quat::from_rotation_x(0.4) * Vec3::Y).length() < 1e-5);
    }

    #[test]
    fn test_joint_count_mismatch_rejected() {
        let e = Entity::new(1, &arm()).unwrap();
        let mut snap = EntitySnapshot::capture(&e);
        snap.joints.push(snap.joints[0]);
        let mut target = Entity::new(1, &arm()).unwrap();
        assert!(snap.apply(&mut target).is_err());
    }
}
