use glam::Vec3;
use kinetik::*;

fn main() -> Result<(), PhysError> {
    logging::init_logging();
    let world = PhysicsWorld::new(WorldConfig::default())?;
    let floor = Part::new(Shape::Plane, 0.0);
    world.create_entity(EntityDesc::static_geometry(Pose::IDENTITY, vec![floor]))?;

    let mut bodies = Vec::new();
    for i in 0..6 {
        let p = Vec3::new(20.0 + i as f32 * 0.2, 20.0, 1.0 + i as f32 * 1.5);
        let shape = if i % 2 == 0 {
            Shape::Sphere { radius: 0.5 }
        } else {
            Shape::Box { half: Vec3::splat(0.5) }
        };
        let desc = EntityDesc::rigid(Pose::from_position(p), vec![Part::new(shape, 1.0)]);
        bodies.push(world.create_entity(desc)?);
    }

    let joints = vec![JointDesc::new(None, Vec3::ZERO).with_params(JointParams::hinge(0))];
    let bob = Part::new(Shape::Sphere { radius: 0.2 }, 1.0)
        .with_local(Pose::from_position(Vec3::Y))
        .on_joint(0);
    let pendulum = world.create_entity(EntityDesc::articulated(
        Pose::from_position(Vec3::new(25.0, 20.0, 3.0)),
        vec![bob],
        joints,
        RootMode::Fixed,
    ))?;

    for tick in 0..600 {
        world.time_step(1.0 / 60.0);
        for event in world.drain_events() {
            match event {
                PhysEvent::Collision { entities, impulse, .. } => {
                    let [a, b] = entities;
                    println!("tick {tick}: {a} hit {b} impulse={impulse:.3}")
                }
                PhysEvent::SleepChanged { entity, sleeping: true } => {
                    println!("tick {tick}: {entity} asleep")
                }
                _ => {}
            }
        }
    }

    for id in bodies {
        let s = world.get_status(id)?;
        println!("body {id}: z={:.3} class={:?}", s.pose.position.z, s.class);
    }
    let s = world.get_status(pendulum)?;
    println!("pendulum angle={:.3} class={:?}", s.joints[0].angles.x, s.class);
    Ok(())
}
