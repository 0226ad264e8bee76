use glam::Vec3;
use kinetik::api::NarrowphaseApi;
use kinetik::narrowphase::Narrowphase;
use kinetik::Pose;
use std::time::Instant;

fn main() {
    let n = 1_000_000u32;
    let mut acc = 0.0f32;
    let start = Instant::now();
    for i in 0..n {
        let t = (i as f32) * 0.001;
        let c0 = Vec3::new(-3.0 + t.sin(), 0.0, 0.0);
        if let Some(hit) = Narrowphase::ray_sphere(c0, Vec3::new(5.0, 0.0, 0.0), Vec3::ZERO, 1.0) {
            acc += hit.toi;
        }
    }
    println!("ray_sphere {} iters in {:?} acc={}", n, start.elapsed(), acc);

    let pose = Pose::IDENTITY;
    let half = Vec3::splat(0.5);
    let mut depth = 0.0f32;
    let start = Instant::now();
    for i in 0..n {
        let t = (i as f32) * 0.001;
        let c = Vec3::new(0.9 * t.cos(), 0.9 * t.sin(), 0.3);
        if let Some(o) = Narrowphase::overlap_sphere_box(c, 0.5, &pose, half) {
            depth += o.depth;
        }
    }
    println!("overlap_sphere_box {} iters in {:?} depth={}", n, start.elapsed(), depth);
}
