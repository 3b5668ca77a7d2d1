//! Face alignment via 4-DOF similarity transform.
//!
//! Before embedding extraction, each detected face is warped to a canonical
//! 112x112 crop: the five SCRFD landmarks are fitted to the ArcFace reference
//! positions by least-squares (scale, rotation, translation), and the frame
//! is sampled through the inverse transform with bilinear interpolation.

/// ArcFace reference landmarks for a 112x112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

const ALIGNED_SIZE: usize = 112;

/// Align a detected face to a canonical 112x112 grayscale crop.
pub fn align_face(
    luma: &[u8],
    width: u32,
    height: u32,
    landmarks: &[(f32, f32); 5],
) -> Vec<u8> {
    let matrix = fit_similarity(landmarks, &REFERENCE_LANDMARKS_112);
    warp_into_crop(luma, width as usize, height as usize, &matrix)
}

/// Fit a 2x3 similarity transform (4-DOF) from `src` to `dst` landmarks.
///
/// Returns [a, -b, tx, b, a, ty] representing:
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
fn fit_similarity(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> [f32; 6] {
    // Overdetermined system A * [a, b, tx, ty]^T = B, two rows per landmark:
    //   sx * a - sy * b + tx = dx
    //   sy * a + sx * b + ty = dy
    // Solved through the normal equations (A^T A) x = A^T b.
    let mut ata = [0.0f32; 16]; // 4x4, row-major
    let mut atb = [0.0f32; 4];

    for i in 0..5 {
        let (sx, sy) = src[i];
        let (dx, dy) = dst[i];

        let r1 = [sx, -sy, 1.0, 0.0];
        let r2 = [sy, sx, 0.0, 1.0];

        for j in 0..4 {
            for k in 0..4 {
                ata[j * 4 + k] += r1[j] * r1[k] + r2[j] * r2[k];
            }
            atb[j] += r1[j] * dx + r2[j] * dy;
        }
    }

    let x = solve_normal_equations(&ata, &atb);
    let (a, b, tx, ty) = (x[0], x[1], x[2], x[3]);

    [a, -b, tx, b, a, ty]
}

/// Solve the 4x4 normal-equation system via Gaussian elimination with
/// partial pivoting. A singular system falls back to an identity-like fit.
#[allow(clippy::needless_range_loop)]
fn solve_normal_equations(ata: &[f32; 16], atb: &[f32; 4]) -> [f32; 4] {
    let mut m = [[0.0f32; 5]; 4];
    for i in 0..4 {
        for j in 0..4 {
            m[i][j] = ata[i * 4 + j];
        }
        m[i][4] = atb[i];
    }

    for col in 0..4 {
        let mut max_row = col;
        let mut max_val = m[col][col].abs();
        for row in (col + 1)..4 {
            if m[row][col].abs() > max_val {
                max_val = m[row][col].abs();
                max_row = row;
            }
        }
        m.swap(col, max_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return [1.0, 0.0, 0.0, 0.0];
        }

        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }

    x
}

/// Sample the source frame through the inverse of `matrix` into a 112x112
/// crop with bilinear interpolation. Out-of-bounds pixels are black.
fn warp_into_crop(luma: &[u8], src_width: usize, src_height: usize, matrix: &[f32; 6]) -> Vec<u8> {
    let out_size = ALIGNED_SIZE;
    let (a, tx, b, ty) = (matrix[0], matrix[2], matrix[3], matrix[5]);

    // Invert the 2x2 part: M = [[a, -b], [b, a]], det = a^2 + b^2
    let det = a * a + b * b;
    if det.abs() < 1e-12 {
        return vec![0u8; out_size * out_size];
    }
    let ia = a / det;
    let ib = b / det;

    let mut output = vec![0u8; out_size * out_size];

    for oy in 0..out_size {
        for ox in 0..out_size {
            // src = M_inv * (dst - t)
            let dx = ox as f32 - tx;
            let dy = oy as f32 - ty;
            let sx = ia * dx + ib * dy;
            let sy = -ib * dx + ia * dy;

            if sx < -1.0 || sy < -1.0 || sx >= src_width as f32 || sy >= src_height as f32 {
                continue;
            }

            let x0 = sx.floor() as i64;
            let y0 = sy.floor() as i64;
            let x1 = x0 + 1;
            let y1 = y0 + 1;
            let fx = sx - x0 as f32;
            let fy = sy - y0 as f32;

            let sample = |x: i64, y: i64| -> f32 {
                if x >= 0 && y >= 0 && (x as usize) < src_width && (y as usize) < src_height {
                    luma[y as usize * src_width + x as usize] as f32
                } else {
                    0.0
                }
            };

            let val = sample(x0, y0) * (1.0 - fx) * (1.0 - fy)
                + sample(x1, y0) * fx * (1.0 - fy)
                + sample(x0, y1) * (1.0 - fx) * fy
                + sample(x1, y1) * fx * fy;

            output[oy * out_size + ox] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_transform() {
        // When src == dst, transform should be identity-like (a≈1, b≈0)
        let pts = REFERENCE_LANDMARKS_112;
        let m = fit_similarity(&pts, &pts);

        assert!((m[0] - 1.0).abs() < 1e-4, "a = {}", m[0]);
        assert!(m[1].abs() < 1e-4, "-b = {}", m[1]);
        assert!(m[2].abs() < 1e-3, "tx = {}", m[2]);
        assert!(m[3].abs() < 1e-4, "b = {}", m[3]);
        assert!((m[4] - 1.0).abs() < 1e-4, "a2 = {}", m[4]);
        assert!(m[5].abs() < 1e-3, "ty = {}", m[5]);
    }

    #[test]
    fn test_scaled_transform() {
        // Source landmarks at 2x scale → transform should have a ≈ 0.5
        let src: [(f32, f32); 5] = [
            (76.5892, 103.3926),
            (147.0636, 103.0028),
            (112.0504, 143.4732),
            (83.0986, 184.7310),
            (141.4598, 184.4082),
        ];
        let m = fit_similarity(&src, &REFERENCE_LANDMARKS_112);
        assert!((m[0] - 0.5).abs() < 0.05, "a = {}, expected ~0.5", m[0]);
    }

    #[test]
    fn test_align_face_output_size() {
        let frame = vec![128u8; 640 * 480];
        let landmarks = REFERENCE_LANDMARKS_112;
        let aligned = align_face(&frame, 640, 480, &landmarks);
        assert_eq!(aligned.len(), 112 * 112);
    }

    #[test]
    fn test_identity_warp_copies_pixels() {
        // Identity transform on a gradient frame reproduces the top-left crop.
        let w = 200usize;
        let h = 200usize;
        let frame: Vec<u8> = (0..w * h).map(|i| (i % 251) as u8).collect();
        let m = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        let out = warp_into_crop(&frame, w, h, &m);
        assert_eq!(out[0], frame[0]);
        assert_eq!(out[5 * ALIGNED_SIZE + 7], frame[5 * w + 7]);
    }

    #[test]
    fn test_out_of_bounds_samples_black() {
        // A transform translating far outside the frame yields black pixels.
        let frame = vec![200u8; 64 * 64];
        let m = [1.0, 0.0, -1000.0, 0.0, 1.0, -1000.0];
        let out = warp_into_crop(&frame, 64, 64, &m);
        assert!(out.iter().all(|&p| p == 0));
    }
}
