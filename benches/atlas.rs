use criterion::{black_box, criterion_group, criterion_main, Criterion};

use glam::{Vec2, Vec3};

use svogi::atlas::{BlockPacker, EvictScore};
use svogi::segment::brick::{crop_to_bounds, texel_index};
use svogi::segment::{BrickBufferPool, BrickChannels, HitObjectType, RawTriangle, SuperMesh};
use svogi::svo::SegmentId;

fn fill_packer(packer: &mut BlockPacker) -> Vec<svogi::atlas::BlockId> {
    let mut ids = Vec::new();
    let mut n = 0u32;
    while let Some(id) = packer.add_block(2, 2, 2, SegmentId(n), 0, 256) {
        ids.push(id);
        n += 1;
    }
    ids
}

fn bench_atlas_fill(c: &mut Criterion) {
    c.bench_function("atlas_fill_16", |b| {
        b.iter(|| {
            let mut packer = BlockPacker::new(black_box(16), 16);
            fill_packer(&mut packer).len()
        });
    });
}

fn bench_atlas_churn(c: &mut Criterion) {
    let mut packer = BlockPacker::new(16, 16);
    let mut ids = fill_packer(&mut packer);
    let mut n = ids.len() as u32;

    c.bench_function("atlas_churn_full_grid", |b| {
        let mut cursor = 0usize;
        b.iter(|| {
            cursor = (cursor + 97) % ids.len();
            packer.remove_block(ids[cursor]);
            n += 1;
            ids[cursor] = packer
                .add_block(2, 2, 2, SegmentId(n), black_box(n), 256)
                .expect("freed gap fits");
        });
    });
}

fn bench_atlas_eviction_scan(c: &mut Criterion) {
    let mut packer = BlockPacker::new(16, 16);
    fill_packer(&mut packer);

    c.bench_function("atlas_eviction_scan", |b| {
        b.iter(|| {
            let victims = packer.select_eviction_candidates(black_box(100), 4, |seg| {
                Some(EvictScore {
                    weighted_frame: seg.0 % 64,
                    last_rendered_frame: seg.0 % 64,
                    last_tex_update_frame: 0,
                })
            });
            black_box(victims)
        });
    });
}

fn quad_tris(x: f32, y: f32) -> [RawTriangle; 2] {
    let a = Vec3::new(x, y, 0.0);
    let b = Vec3::new(x + 1.0, y, 0.0);
    let c = Vec3::new(x + 1.0, y + 1.0, 0.0);
    let d = Vec3::new(x, y + 1.0, 0.0);
    let tri = |p: [Vec3; 3]| RawTriangle {
        positions: p,
        uvs: [
            Vec2::new(p[0].x, p[0].y),
            Vec2::new(p[1].x, p[1].y),
            Vec2::new(p[2].x, p[2].y),
        ],
        colors: [[255; 4]; 3],
        normal: Vec3::Z,
        area: 100,
        opacity: 255,
        object_type: HitObjectType::Mesh,
        material: None,
    };
    [tri([a, b, c]), tri([a, c, d])]
}

fn bench_supermesh_dedup(c: &mut Criterion) {
    // 32x32 quad grid: every interior vertex is shared by up to six
    // triangles, so this is dominated by the hash lookup path
    c.bench_function("supermesh_grid_32x32", |b| {
        b.iter(|| {
            let mut mesh = SuperMesh::new();
            for j in 0..32 {
                for i in 0..32 {
                    for tri in quad_tris(i as f32, j as f32) {
                        mesh.add_triangle(black_box(tri));
                    }
                }
            }
            mesh.verts().len()
        });
    });
}

fn bench_crop_sparse_brick(c: &mut Criterion) {
    let pool = BrickBufferPool::new(8);

    c.bench_function("crop_sparse_brick", |b| {
        b.iter(|| {
            let mut channels = BrickChannels::allocate(&pool);
            channels.opacity[texel_index(3, 4, 5)] = [255, 0, 0, 1];
            channels.opacity[texel_index(10, 11, 12)] = [0, 255, 0, 1];
            crop_to_bounds(black_box(&mut channels))
        });
    });
}

criterion_group!(
    benches,
    bench_atlas_fill,
    bench_atlas_churn,
    bench_atlas_eviction_scan,
    bench_supermesh_dedup,
    bench_crop_sparse_brick
);
criterion_main!(benches);
