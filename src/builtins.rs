// CPU model of the built-in driven shaders
//
// Mirrors shaders/builtins.vert and shaders/builtins.frag so the geometry and
// colors a frame should contain can be checked without a GPU. Window
// coordinates use the bottom-left origin, y up. Only the vertex count is
// needed outside tests.

#[cfg(test)]
use glam::{UVec2, Vec2, Vec4};

/// Vertices per draw: a triangle strip of 4 gives 2 triangles
pub const STRIP_VERTEX_COUNT: u32 = 4;

/// Height in pixels of one blue stripe
#[cfg(test)]
pub const STRIPE_PERIOD: f32 = 50.0;

#[cfg(test)]
const STRIPE_SCALE: f32 = 0.02;

/// Clip-space position the vertex stage emits for invocation `index`
#[cfg(test)]
pub fn vertex_position(index: u32) -> Vec4 {
    Vec4::new((index % 2) as f32, ((index / 2) % 2) as f32, 0.0, 1.0)
}

/// Blue channel for a fragment at window height `y`
#[cfg(test)]
pub fn stripe(y: f32) -> f32 {
    // GLSL mod() floors, which is rem_euclid for a positive divisor
    y.rem_euclid(STRIPE_PERIOD) * STRIPE_SCALE
}

/// Color the fragment stage writes for `primitive` at `frag_coord`
#[cfg(test)]
pub fn fragment_color(primitive: u32, frag_coord: Vec2) -> Vec4 {
    Vec4::new(0.0, primitive as f32, stripe(frag_coord.y), 1.0)
}

/// Vertex indices of each triangle a strip of `vertex_count` vertices assembles
#[cfg(test)]
pub fn strip_triangles(vertex_count: u32) -> impl Iterator<Item = [u32; 3]> {
    (0..vertex_count.saturating_sub(2)).map(|p| [p, p + 1, p + 2])
}

/// Viewport transform: clip space to window pixels
#[cfg(test)]
pub fn to_window(clip: Vec4, size: UVec2) -> Vec2 {
    let ndc = clip.truncate().truncate() / clip.w;
    (ndc + Vec2::ONE) * 0.5 * size.as_vec2()
}

/// Primitive index covering `point`, or `None` for background
///
/// Points on the shared edge go to the earlier triangle.
#[cfg(test)]
pub fn primitive_at(point: Vec2, size: UVec2) -> Option<u32> {
    strip_triangles(STRIP_VERTEX_COUNT)
        .position(|indices| {
            let [a, b, c] = indices.map(|i| to_window(vertex_position(i), size));
            contains(a, b, c, point)
        })
        .map(|p| p as u32)
}

/// Expected color of the pixel whose center is `point` after one frame
#[cfg(test)]
pub fn shade(point: Vec2, size: UVec2, clear: Vec4) -> Vec4 {
    match primitive_at(point, size) {
        Some(primitive) => fragment_color(primitive, point),
        None => clear,
    }
}

// Strips alternate winding, so accept either orientation
#[cfg(test)]
fn contains(a: Vec2, b: Vec2, c: Vec2, p: Vec2) -> bool {
    let edge = |from: Vec2, to: Vec2| (to - from).perp_dot(p - from);
    let (e0, e1, e2) = (edge(a, b), edge(b, c), edge(c, a));
    (e0 >= 0.0 && e1 >= 0.0 && e2 >= 0.0) || (e0 <= 0.0 && e1 <= 0.0 && e2 <= 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: UVec2 = UVec2::new(800, 600);
    const GRAY: Vec4 = Vec4::new(0.5, 0.5, 0.5, 0.0);

    #[test]
    fn four_invocations_give_the_unit_square() {
        let corners: Vec<Vec4> = (0..STRIP_VERTEX_COUNT).map(vertex_position).collect();
        assert_eq!(
            corners,
            vec![
                Vec4::new(0.0, 0.0, 0.0, 1.0),
                Vec4::new(1.0, 0.0, 0.0, 1.0),
                Vec4::new(0.0, 1.0, 0.0, 1.0),
                Vec4::new(1.0, 1.0, 0.0, 1.0),
            ]
        );
    }

    #[test]
    fn corners_repeat_past_the_fourth_vertex() {
        for i in 0..16 {
            assert_eq!(vertex_position(i), vertex_position(i % 4));
        }
    }

    #[test]
    fn strip_of_four_is_two_triangles_sharing_an_edge() {
        let triangles: Vec<_> = strip_triangles(STRIP_VERTEX_COUNT).collect();
        assert_eq!(triangles, vec![[0, 1, 2], [1, 2, 3]]);
        assert_eq!(strip_triangles(2).count(), 0);
        assert_eq!(strip_triangles(0).count(), 0);
    }

    #[test]
    fn stripe_stays_in_range_and_repeats_every_fifty_pixels() {
        for y in 0..600 {
            let y = y as f32;
            let value = stripe(y);
            assert!((0.0..=0.98 + 1e-6).contains(&value), "stripe({y}) = {value}");
            assert!((stripe(y + STRIPE_PERIOD) - value).abs() < 1e-4);
        }
        assert!((stripe(25.0) - 0.5).abs() < 1e-6);
        assert_eq!(stripe(0.0), 0.0);
        assert_eq!(stripe(50.0), 0.0);
    }

    #[test]
    fn green_is_flat_per_primitive() {
        for y in [0.5, 17.0, 333.25, 599.5] {
            let point = Vec2::new(123.0, y);
            assert_eq!(fragment_color(0, point).y, 0.0);
            assert_eq!(fragment_color(1, point).y, 1.0);
            assert_eq!(fragment_color(1, point).x, 0.0);
            assert_eq!(fragment_color(1, point).w, 1.0);
        }
    }

    #[test]
    fn quad_covers_the_upper_right_quadrant() {
        assert_eq!(to_window(vertex_position(0), WINDOW), Vec2::new(400.0, 300.0));
        assert_eq!(to_window(vertex_position(3), WINDOW), Vec2::new(800.0, 600.0));
    }

    #[test]
    fn triangles_split_along_the_anti_diagonal() {
        // Below the (800,300)-(400,600) diagonal: first triangle
        assert_eq!(primitive_at(Vec2::new(450.5, 350.5), WINDOW), Some(0));
        // Above it: second triangle
        assert_eq!(primitive_at(Vec2::new(750.5, 550.5), WINDOW), Some(1));
        // Outside the quad
        assert_eq!(primitive_at(Vec2::new(100.5, 100.5), WINDOW), None);
        assert_eq!(primitive_at(Vec2::new(600.5, 250.5), WINDOW), None);
    }

    #[test]
    fn shading_a_frame() {
        let background = shade(Vec2::new(400.0, 25.0), WINDOW, GRAY);
        assert_eq!(background, GRAY);

        let lit = shade(Vec2::new(750.0, 575.0), WINDOW, GRAY);
        assert_eq!(lit.y, 1.0);
        assert!((lit.z - 0.5).abs() < 1e-6);

        let lower = shade(Vec2::new(420.0, 325.0), WINDOW, GRAY);
        assert_eq!(lower.y, 0.0);
        assert!((lower.z - 0.5).abs() < 1e-6);
    }
}
