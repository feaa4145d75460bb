use image::RgbaImage;

pub const DEFAULT_SAME_THRESHOLD: f64 = 0.99;

/// Fraction of pixels whose RGBA value is identical in both images.
///
/// Returns `None` when the dimensions differ, since the images are not
/// comparable pixel-for-pixel. Two empty images of equal size match fully.
pub fn exact_match_ratio(a: &RgbaImage, b: &RgbaImage) -> Option<f64> {
    if a.dimensions() != b.dimensions() {
        return None;
    }

    let total_pixels = (a.width() as u64) * (a.height() as u64);
    if total_pixels == 0 {
        return Some(1.0);
    }

    let matching = a
        .pixels()
        .zip(b.pixels())
        .filter(|(pa, pb)| pa == pb)
        .count() as u64;

    Some(matching as f64 / total_pixels as f64)
}

/// Coarse duplicate-frame check: equal dimensions and an exact-match ratio
/// at or above `threshold`.
pub fn images_are_same(a: &RgbaImage, b: &RgbaImage, threshold: f64) -> bool {
    exact_match_ratio(a, b).is_some_and(|ratio| ratio >= threshold)
}
