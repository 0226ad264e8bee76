use glam::Vec3;
use kinetik::*;
use std::time::Instant;

fn lcg(seed: &mut u32) -> u32 {
    *seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
    *seed
}

fn unit(seed: &mut u32) -> f32 {
    lcg(seed) as f32 / u32::MAX as f32
}

fn main() -> Result<(), PhysError> {
    logging::init_logging();
    let cfg = WorldConfig { enable_timing: true, ..WorldConfig::default() };
    let world = PhysicsWorld::new(cfg)?;
    let floor = Part::new(Shape::Plane, 0.0);
    world.create_entity(EntityDesc::static_geometry(Pose::IDENTITY, vec![floor]))?;

    let n = 5_000usize; // number of bodies
    let mut seed = 1u32;
    for i in 0..n {
        let x = 16.0 + unit(&mut seed) * 200.0;
        let y = 16.0 + unit(&mut seed) * 200.0;
        let p = Vec3::new(x, y, 1.0 + unit(&mut seed) * 20.0);
        let v = Vec3::new(unit(&mut seed) * 4.0 - 2.0, unit(&mut seed) * 4.0 - 2.0, 0.0);
        let shape = if i % 2 == 0 {
            Shape::Box { half: Vec3::splat(0.5) }
        } else {
            Shape::Sphere { radius: 0.5 }
        };
        let desc = EntityDesc::rigid(Pose::from_position(p), vec![Part::new(shape, 1.0)]);
        world.create_entity(desc.with_velocity(v, Vec3::ZERO))?;
    }

    let ticks = 240;
    let t0 = Instant::now();
    for tick in 0..ticks {
        world.time_step(1.0 / 60.0);
        if tick % 60 == 59 {
            let s = world.stats();
            println!(
                "tick {:>4}: awake={} islands={} contacts={} step_backs={}",
                tick + 1,
                s.awake,
                s.islands,
                s.contacts,
                s.step_backs
            );
        }
    }
    let total = t0.elapsed();
    let n_events = world.drain_events().len();
    if let Some(t) = world.timing() {
        println!(
            "N={} workers={} last tick={:.3}ms (islands={:.3}ms solve={:.3}ms \
             reposition={:.3}ms replay={:.3}ms) avg={:.3}ms events={}",
            n,
            world.config().threads.workers,
            t.step_ms,
            t.islands_ms,
            t.solve_ms,
            t.reposition_ms,
            t.replay_ms,
            total.as_secs_f64() * 1000.0 / ticks as f64,
            n_events
        );
    } else {
        println!("N={} ticks={} total={:?} events={}", n, ticks, total, n_events);
    }
    Ok(())
}
