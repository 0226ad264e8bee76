use glam::Vec3;
use kinetik::*;

fn main() -> Result<(), PhysError> {
    let world = PhysicsWorld::new(WorldConfig::default())?;

    let crate_box = Part::new(Shape::Box { half: Vec3::splat(0.5) }, 0.0);
    let wall_pose = Pose::from_position(Vec3::new(22.0, 20.0, 0.5));
    let wall = world.create_entity(EntityDesc::static_geometry(wall_pose, vec![crate_box]))?;
    let ball = world.create_entity(EntityDesc::rigid(
        Pose::from_position(Vec3::new(24.0, 20.0, 0.5)),
        vec![Part::new(Shape::Sphere { radius: 0.5 }, 1.0)],
    ))?;

    let ray = RayQuery::new(Vec3::new(20.0, 20.0, 0.5), Vec3::new(10.0, 0.0, 0.0));
    match world.ray_query(&ray).blocking {
        Some(hit) => println!(
            "Ray hit id={} part={} d={:.3} n=({:.2},{:.2},{:.2}) (wall={}, ball={})",
            hit.entity, hit.part, hit.distance, hit.normal.x, hit.normal.y, hit.normal.z, wall, ball
        ),
        None => println!("No hit"),
    }

    let past_wall = world.ray_query(&ray.skipping(wall));
    if let Some(hit) = past_wall.blocking {
        println!("Skipping the wall: id={} d={:.3}", hit.entity, hit.distance);
    }
    Ok(())
}
