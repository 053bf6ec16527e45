//! Triangle/AABB overlap and barycentric helpers used by the voxelizer

use crate::core::types::Vec3;
use super::aabb::Aabb;

/// Separating-axis triangle vs. AABB overlap test.
///
/// Tests the 3 box axes, the triangle plane, and the 9 edge cross products.
pub fn tri_intersects_aabb(aabb: &Aabb, a: Vec3, b: Vec3, c: Vec3) -> bool {
    let center = aabb.center();
    let h = aabb.half_extent();

    // translate triangle to box space
    let v0 = a - center;
    let v1 = b - center;
    let v2 = c - center;

    let e0 = v1 - v0;
    let e1 = v2 - v1;
    let e2 = v0 - v2;

    // box axes
    for axis in 0..3 {
        let lo = v0[axis].min(v1[axis]).min(v2[axis]);
        let hi = v0[axis].max(v1[axis]).max(v2[axis]);
        if lo > h[axis] || hi < -h[axis] {
            return false;
        }
    }

    // triangle plane
    let n = e0.cross(e1);
    let d = n.dot(v0);
    let r = h.x * n.x.abs() + h.y * n.y.abs() + h.z * n.z.abs();
    if d.abs() > r {
        return false;
    }

    // cross-product axes
    let edges = [e0, e1, e2];
    let units = [Vec3::X, Vec3::Y, Vec3::Z];
    for e in &edges {
        for u in &units {
            let axis = u.cross(*e);
            if axis.length_squared() < 1e-12 {
                continue;
            }
            let p0 = axis.dot(v0);
            let p1 = axis.dot(v1);
            let p2 = axis.dot(v2);
            let lo = p0.min(p1).min(p2);
            let hi = p0.max(p1).max(p2);
            let r = h.x * axis.x.abs() + h.y * axis.y.abs() + h.z * axis.z.abs();
            if lo > r || hi < -r {
                return false;
            }
        }
    }

    true
}

/// Barycentric coordinates of `p` in triangle `abc`.
///
/// Returns `(u, v, w, inside)` where `inside` tolerates a `border` margin
/// outside the triangle (degenerate triangles resolve as outside).
pub fn barycentric(a: Vec3, b: Vec3, c: Vec3, p: Vec3, border: f32) -> (f32, f32, f32, bool) {
    let v0 = b - a;
    let v1 = c - a;
    let v2 = p - a;
    let d00 = v0.dot(v0);
    let d01 = v0.dot(v1);
    let d11 = v1.dot(v1);
    let d20 = v2.dot(v0);
    let d21 = v2.dot(v1);
    let d = d00 * d11 - d01 * d01;
    let inv = if d != 0.0 { 1.0 / d } else { 1_000_000.0 };
    let v = (d11 * d20 - d01 * d21) * inv;
    let w = (d00 * d21 - d01 * d20) * inv;
    let u = 1.0 - v - w;
    (u, v, w, u >= -border && v >= -border && w >= -border)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tri_inside_box() {
        let aabb = Aabb::new(Vec3::ZERO, Vec3::splat(4.0));
        assert!(tri_intersects_aabb(
            &aabb,
            Vec3::new(1.0, 1.0, 1.0),
            Vec3::new(2.0, 1.0, 1.0),
            Vec3::new(1.0, 2.0, 1.0),
        ));
    }

    #[test]
    fn test_tri_outside_box() {
        let aabb = Aabb::new(Vec3::ZERO, Vec3::ONE);
        assert!(!tri_intersects_aabb(
            &aabb,
            Vec3::new(5.0, 5.0, 5.0),
            Vec3::new(6.0, 5.0, 5.0),
            Vec3::new(5.0, 6.0, 5.0),
        ));
    }

    #[test]
    fn test_tri_crossing_box_face() {
        // large triangle slicing through the box without any vertex inside
        let aabb = Aabb::new(Vec3::ZERO, Vec3::ONE);
        assert!(tri_intersects_aabb(
            &aabb,
            Vec3::new(-10.0, -10.0, 0.5),
            Vec3::new(10.0, -10.0, 0.5),
            Vec3::new(0.0, 10.0, 0.5),
        ));
    }

    #[test]
    fn test_tri_plane_separates() {
        // triangle plane parallel to the box top face, above it
        let aabb = Aabb::new(Vec3::ZERO, Vec3::ONE);
        assert!(!tri_intersects_aabb(
            &aabb,
            Vec3::new(-10.0, -10.0, 1.5),
            Vec3::new(10.0, -10.0, 1.5),
            Vec3::new(0.0, 10.0, 1.5),
        ));
    }

    #[test]
    fn test_barycentric_center() {
        let a = Vec3::ZERO;
        let b = Vec3::new(1.0, 0.0, 0.0);
        let c = Vec3::new(0.0, 1.0, 0.0);
        let (u, v, w, inside) = barycentric(a, b, c, Vec3::new(0.25, 0.25, 0.0), 0.0);
        assert!(inside);
        assert!((u + v + w - 1.0).abs() < 1e-5);
        assert!((v - 0.25).abs() < 1e-5);
        assert!((w - 0.25).abs() < 1e-5);
    }

    #[test]
    fn test_barycentric_outside() {
        let a = Vec3::ZERO;
        let b = Vec3::new(1.0, 0.0, 0.0);
        let c = Vec3::new(0.0, 1.0, 0.0);
        let (.., inside) = barycentric(a, b, c, Vec3::new(2.0, 2.0, 0.0), 0.1);
        assert!(!inside);
    }
}
