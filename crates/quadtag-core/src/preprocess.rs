//! Input conditioning: decimation, Gaussian low-pass, unsharp sharpening.

use crate::image::{Image8, ImageF32, ImageView};

/// Nearest-neighbour downsample by an integer factor into `dst`.
///
/// A factor of 1 degenerates into a plain copy. The output dimensions are
/// `floor(w / f) x floor(h / f)`; trailing rows/columns that do not fill a
/// whole cell are dropped.
pub fn decimate(src: &ImageView<'_>, factor: usize, dst: &mut Image8) {
    debug_assert!(factor >= 1);
    if factor == 1 {
        dst.copy_from(src);
        return;
    }
    let w = src.width / factor;
    let h = src.height / factor;
    dst.reshape(w, h);
    for y in 0..h {
        let src_row = src.row(y * factor);
        let dst_row = dst.row_mut(y);
        for (x, out) in dst_row.iter_mut().enumerate() {
            *out = src_row[x * factor];
        }
    }
}

/// In-place separable Gaussian low-pass with standard deviation `sigma`.
///
/// The kernel radius is `ceil(3 * sigma)`; borders are handled by clamping.
/// `sigma <= 0` is a no-op.
pub fn gaussian_blur(img: &mut Image8, sigma: f32, scratch: &mut ImageF32) {
    if sigma <= 0.0 {
        return;
    }
    let kernel = gaussian_kernel(sigma);
    separable_pass(img, &kernel, scratch);
}

/// In-place unsharp mask: `2 * I - blur(I)`, used when a negative blur
/// radius is configured to sharpen soft optics instead.
pub fn sharpen(img: &mut Image8, sigma: f32, scratch: &mut ImageF32) {
    if sigma <= 0.0 {
        return;
    }
    let original = img.clone();
    gaussian_blur(img, sigma, scratch);
    for y in 0..img.height() {
        let blurred = img.row_mut(y);
        let orig = original.row(y);
        for (b, &o) in blurred.iter_mut().zip(orig) {
            let v = 2.0 * f32::from(o) - f32::from(*b);
            *b = v.clamp(0.0, 255.0) as u8;
        }
    }
}

fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = (3.0 * sigma).ceil().max(1.0) as usize;
    let mut kernel = Vec::with_capacity(2 * radius + 1);
    let coeff = -1.0 / (2.0 * sigma * sigma);
    for i in 0..=2 * radius {
        let d = i as f32 - radius as f32;
        kernel.push((coeff * d * d).exp());
    }
    let sum: f32 = kernel.iter().sum();
    for k in &mut kernel {
        *k /= sum;
    }
    kernel
}

fn separable_pass(img: &mut Image8, kernel: &[f32], scratch: &mut ImageF32) {
    let w = img.width();
    let h = img.height();
    let radius = kernel.len() / 2;
    scratch.reshape(w, h);

    // Horizontal pass into the float scratch.
    for y in 0..h {
        let src_row = img.row(y).to_vec();
        let dst_row = scratch.row_mut(y);
        for x in 0..w {
            let mut acc = 0.0f32;
            for (k, &coeff) in kernel.iter().enumerate() {
                let sx = (x as isize + k as isize - radius as isize).clamp(0, w as isize - 1);
                acc += f32::from(src_row[sx as usize]) * coeff;
            }
            dst_row[x] = acc;
        }
    }

    // Vertical pass back into the byte image.
    for x in 0..w {
        let mut column = Vec::with_capacity(h);
        for y in 0..h {
            column.push(scratch.row(y)[x]);
        }
        for y in 0..h {
            let mut acc = 0.0f32;
            for (k, &coeff) in kernel.iter().enumerate() {
                let sy = (y as isize + k as isize - radius as isize).clamp(0, h as isize - 1);
                acc += column[sy as usize] * coeff;
            }
            img.row_mut(y)[x] = acc.round().clamp(0.0, 255.0) as u8;
        }
    }
}
