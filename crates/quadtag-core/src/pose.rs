//! 6-DoF tag pose from camera intrinsics and physical tag size.
//!
//! The homography is decomposed into an initial `(R, t)` guess, which is
//! then polished by orthogonal iteration (Lu, Hager, Mjolsness): the
//! translation is the least-squares optimum under the fixed rotation, and
//! the rotation is re-estimated by projecting the point-correspondence
//! cross-covariance onto SO(3). Iteration stops when the rotation update
//! falls below `1e-9` or after 50 rounds; non-convergence is reported as a
//! status, the best iterate is still returned.

use nalgebra::{Matrix3, Matrix4, Vector3};

use crate::decoder::Homography;
use crate::detector::Detection;

/// Iteration cap for the orthogonal iteration.
const MAX_ITERATIONS: usize = 50;
/// Frobenius norm of the rotation update below which we stop.
const CONVERGENCE_EPS: f64 = 1e-9;

/// Pinhole camera intrinsics.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CameraIntrinsics {
    /// Focal length in x (pixels).
    pub fx: f64,
    /// Focal length in y (pixels).
    pub fy: f64,
    /// Principal point x (pixels).
    pub cx: f64,
    /// Principal point y (pixels).
    pub cy: f64,
}

impl CameraIntrinsics {
    /// Create new intrinsics.
    #[must_use]
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// The 3x3 calibration matrix.
    #[must_use]
    pub fn as_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    /// Inverse calibration matrix.
    #[must_use]
    pub fn inv_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            1.0 / self.fx,
            0.0,
            -self.cx / self.fx,
            0.0,
            1.0 / self.fy,
            -self.cy / self.fy,
            0.0,
            0.0,
            1.0,
        )
    }
}

/// A recovered tag pose: rigid transform from the tag frame (origin at the
/// tag center, z out of the tag plane) into the camera frame.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TagPose {
    /// Homogeneous 4x4 transform; translation units follow `tag_size`.
    pub transform: Matrix4<f64>,
    /// Final object-space error of the iteration.
    pub object_error: f64,
    /// False when the iteration hit its cap before the update fell below
    /// tolerance.
    pub converged: bool,
}

impl TagPose {
    /// Rotation block of the transform.
    #[must_use]
    pub fn rotation(&self) -> Matrix3<f64> {
        self.transform.fixed_view::<3, 3>(0, 0).into_owned()
    }

    /// Translation column of the transform.
    #[must_use]
    pub fn translation(&self) -> Vector3<f64> {
        self.transform.fixed_view::<3, 1>(0, 3).into_owned()
    }

    /// Project a tag-frame point into the image.
    #[must_use]
    pub fn project(&self, point: &Vector3<f64>, intrinsics: &CameraIntrinsics) -> [f64; 2] {
        let p = self.rotation() * point + self.translation();
        [
            p.x / p.z * intrinsics.fx + intrinsics.cx,
            p.y / p.z * intrinsics.fy + intrinsics.cy,
        ]
    }
}

/// Estimate the pose of a detection. `tag_size` is the physical edge
/// length of the black border square; translation units match it.
#[must_use]
pub fn pose_from_detection(
    det: &Detection,
    intrinsics: &CameraIntrinsics,
    tag_size: f64,
) -> Option<TagPose> {
    estimate_pose(&det.corners, intrinsics, tag_size, false)
}

/// Full-control pose estimation from quad corners in canonical order.
/// `refine` adds a reprojection Gauss-Newton polish after the orthogonal
/// iteration.
#[must_use]
pub fn estimate_pose(
    corners: &[[f64; 2]; 4],
    intrinsics: &CameraIntrinsics,
    tag_size: f64,
    refine: bool,
) -> Option<TagPose> {
    let h = Homography::square_to_quad(corners)?;
    let s = tag_size * 0.5;
    let object = [
        Vector3::new(-s, -s, 0.0),
        Vector3::new(s, -s, 0.0),
        Vector3::new(s, s, 0.0),
        Vector3::new(-s, s, 0.0),
    ];

    // Unit-plane rays through the detected corners.
    let mut rays = [Vector3::zeros(); 4];
    for i in 0..4 {
        rays[i] = Vector3::new(
            (corners[i][0] - intrinsics.cx) / intrinsics.fx,
            (corners[i][1] - intrinsics.cy) / intrinsics.fy,
            1.0,
        );
    }

    let (r0, t0) = homography_seed(&h, intrinsics, tag_size)?;
    let (r, t, object_error, converged) = orthogonal_iteration(&rays, &object, r0, t0);

    let (r, t) = if refine {
        gauss_newton_polish(corners, intrinsics, &object, r, t)
    } else {
        (r, t)
    };

    let mut transform = Matrix4::identity();
    transform.fixed_view_mut::<3, 3>(0, 0).copy_from(&r);
    transform.fixed_view_mut::<3, 1>(0, 3).copy_from(&t);
    Some(TagPose {
        transform,
        object_error,
        converged,
    })
}

/// Closed-form `(R, t)` from the calibrated homography columns.
fn homography_seed(
    h: &Homography,
    intrinsics: &CameraIntrinsics,
    tag_size: f64,
) -> Option<(Matrix3<f64>, Vector3<f64>)> {
    let hn = intrinsics.inv_matrix() * h.h;
    let mut c0 = hn.column(0).into_owned();
    let mut c1 = hn.column(1).into_owned();
    let mut c2 = hn.column(2).into_owned();

    let scale = f64::midpoint(c0.norm(), c1.norm());
    if scale < 1e-12 {
        return None;
    }
    c0 /= scale;
    c1 /= scale;
    c2 /= scale;

    // The tag must sit in front of the camera.
    if c2.z < 0.0 {
        c0 = -c0;
        c1 = -c1;
        c2 = -c2;
    }

    let r_raw = Matrix3::from_columns(&[c0, c1, c0.cross(&c1)]);
    let r = project_so3(&r_raw)?;
    let t = c2 * (tag_size * 0.5);
    Some((r, t))
}

/// Nearest rotation matrix in the Frobenius sense: `R = U * V^T` with the
/// determinant sign folded into the last column of `U`.
fn project_so3(m: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let svd = m.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_fixed = u;
        u_fixed.column_mut(2).neg_mut();
        r = u_fixed * v_t;
    }
    Some(r)
}

/// Lu-Hager-Mjolsness orthogonal iteration over the 4 corners.
fn orthogonal_iteration(
    rays: &[Vector3<f64>; 4],
    object: &[Vector3<f64>; 4],
    r_init: Matrix3<f64>,
    t_init: Vector3<f64>,
) -> (Matrix3<f64>, Vector3<f64>, f64, bool) {
    let n = 4.0;

    // Per-ray projection operators F_i = v v^T / (v^T v).
    let mut ops = [Matrix3::zeros(); 4];
    let mut op_mean = Matrix3::zeros();
    for (op, v) in ops.iter_mut().zip(rays) {
        *op = v * v.transpose() / v.norm_squared();
        op_mean += *op;
    }
    op_mean /= n;

    let Some(m1_inv) = (Matrix3::identity() - op_mean).try_inverse() else {
        return (r_init, t_init, f64::MAX, false);
    };

    let p_mean: Vector3<f64> = (object[0] + object[1] + object[2] + object[3]) / n;

    let mut r = r_init;
    let mut t = t_init;
    let mut converged = false;

    for _ in 0..MAX_ITERATIONS {
        // Optimal translation for the current rotation.
        let mut acc = Vector3::zeros();
        for (op, p) in ops.iter().zip(object) {
            let rp = r * p;
            acc += (op * rp - rp) / n;
        }
        t = m1_inv * acc;

        // Re-estimate the rotation from the projected correspondences.
        let mut q = [Vector3::zeros(); 4];
        let mut q_mean = Vector3::zeros();
        for (i, (op, p)) in ops.iter().zip(object).enumerate() {
            q[i] = op * (r * p + t);
            q_mean += q[i];
        }
        q_mean /= n;

        let mut cross_cov = Matrix3::zeros();
        for (qi, p) in q.iter().zip(object) {
            cross_cov += (qi - q_mean) * (p - p_mean).transpose();
        }
        let Some(r_new) = project_so3(&cross_cov) else {
            break;
        };

        let delta = (r_new - r).norm();
        r = r_new;
        if delta < CONVERGENCE_EPS {
            converged = true;
            break;
        }
    }

    let mut err = 0.0;
    for (op, p) in ops.iter().zip(object) {
        let q = r * p + t;
        err += ((Matrix3::identity() - op) * q).norm_squared();
    }
    (r, t, err, converged)
}

/// Reprojection polish: damped Gauss-Newton on the se(3) perturbation.
fn gauss_newton_polish(
    corners: &[[f64; 2]; 4],
    intrinsics: &CameraIntrinsics,
    object: &[Vector3<f64>; 4],
    mut r: Matrix3<f64>,
    mut t: Vector3<f64>,
) -> (Matrix3<f64>, Vector3<f64>) {
    use nalgebra::{Matrix6, Vector6};

    let reproj_err = |r: &Matrix3<f64>, t: &Vector3<f64>| -> f64 {
        let mut e = 0.0;
        for (p, c) in object.iter().zip(corners) {
            let pc = r * p + t;
            let u = pc.x / pc.z * intrinsics.fx + intrinsics.cx;
            let v = pc.y / pc.z * intrinsics.fy + intrinsics.cy;
            e += (u - c[0]).powi(2) + (v - c[1]).powi(2);
        }
        e
    };

    let mut lambda = 1e-3;
    let mut current = reproj_err(&r, &t);

    for _ in 0..10 {
        let mut jtj = Matrix6::<f64>::zeros();
        let mut jtr = Vector6::<f64>::zeros();

        for (p, c) in object.iter().zip(corners) {
            let pc = r * p + t;
            let z_inv = 1.0 / pc.z;
            let z_inv2 = z_inv * z_inv;

            let u = pc.x * z_inv * intrinsics.fx + intrinsics.cx;
            let v = pc.y * z_inv * intrinsics.fy + intrinsics.cy;
            let ru = c[0] - u;
            let rv = c[1] - v;

            let du = Vector3::new(intrinsics.fx * z_inv, 0.0, -intrinsics.fx * pc.x * z_inv2);
            let dv = Vector3::new(0.0, intrinsics.fy * z_inv, -intrinsics.fy * pc.y * z_inv2);

            let mut row_u = Vector6::zeros();
            let mut row_v = Vector6::zeros();
            for k in 0..3 {
                row_u[k] = du[k];
                row_v[k] = dv[k];
            }
            row_u[3] = du[1] * pc.z - du[2] * pc.y;
            row_u[4] = du[2] * pc.x - du[0] * pc.z;
            row_u[5] = du[0] * pc.y - du[1] * pc.x;
            row_v[3] = dv[1] * pc.z - dv[2] * pc.y;
            row_v[4] = dv[2] * pc.x - dv[0] * pc.z;
            row_v[5] = dv[0] * pc.y - dv[1] * pc.x;

            jtj += row_u * row_u.transpose() + row_v * row_v.transpose();
            jtr += row_u * ru + row_v * rv;
        }

        for k in 0..6 {
            jtj[(k, k)] += lambda;
        }
        let Some(chol) = jtj.cholesky() else {
            lambda *= 10.0;
            continue;
        };
        let delta = chol.solve(&jtr);

        let twist = Vector3::new(delta[3], delta[4], delta[5]);
        let update_rot = nalgebra::Rotation3::new(twist).into_inner();
        let new_r = update_rot * r;
        let new_t = update_rot * t + Vector3::new(delta[0], delta[1], delta[2]);

        let new_err = reproj_err(&new_r, &new_t);
        if new_err < current {
            r = new_r;
            t = new_t;
            current = new_err;
            lambda *= 0.1;
        } else {
            lambda *= 10.0;
        }
        if delta.norm() < 1e-10 {
            break;
        }
    }
    (r, t)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn project_corners(
        r: &Matrix3<f64>,
        t: &Vector3<f64>,
        intrinsics: &CameraIntrinsics,
        tag_size: f64,
    ) -> [[f64; 2]; 4] {
        let s = tag_size * 0.5;
        let object = [
            Vector3::new(-s, -s, 0.0),
            Vector3::new(s, -s, 0.0),
            Vector3::new(s, s, 0.0),
            Vector3::new(-s, s, 0.0),
        ];
        let mut out = [[0.0; 2]; 4];
        for (o, p) in out.iter_mut().zip(&object) {
            let pc = r * p + t;
            o[0] = pc.x / pc.z * intrinsics.fx + intrinsics.cx;
            o[1] = pc.y / pc.z * intrinsics.fy + intrinsics.cy;
        }
        out
    }

    #[test]
    fn frontal_pose_recovers_exactly() {
        let k = CameraIntrinsics::new(800.0, 800.0, 320.0, 240.0);
        let gt_r = Matrix3::identity();
        let gt_t = Vector3::new(0.05, -0.02, 1.2);
        let tag_size = 0.16;
        let corners = project_corners(&gt_r, &gt_t, &k, tag_size);

        let pose = estimate_pose(&corners, &k, tag_size, false).unwrap();
        assert!((pose.translation() - gt_t).norm() < 1e-6);
        assert!((pose.rotation() - gt_r).norm() < 1e-6);
        assert!(pose.converged);
        assert!(pose.object_error < 1e-12);
    }

    #[test]
    fn tilted_pose_recovers_within_tolerance() {
        let k = CameraIntrinsics::new(600.0, 600.0, 320.0, 240.0);
        let gt_r = nalgebra::Rotation3::from_euler_angles(0.3, -0.25, 0.1).into_inner();
        let gt_t = Vector3::new(-0.08, 0.04, 0.9);
        let tag_size = 0.1;
        let corners = project_corners(&gt_r, &gt_t, &k, tag_size);

        let pose = estimate_pose(&corners, &k, tag_size, true).unwrap();
        assert!((pose.translation() - gt_t).norm() < 1e-4);
        assert!((pose.rotation() - gt_r).norm() < 1e-3);
    }

    #[test]
    fn rotation_block_stays_orthonormal() {
        let k = CameraIntrinsics::new(700.0, 710.0, 300.0, 260.0);
        let gt_r = nalgebra::Rotation3::from_euler_angles(-0.4, 0.2, 0.35).into_inner();
        let gt_t = Vector3::new(0.1, 0.1, 2.0);
        let corners = project_corners(&gt_r, &gt_t, &k, 0.2);

        let pose = estimate_pose(&corners, &k, 0.2, false).unwrap();
        let r = pose.rotation();
        assert!((r * r.transpose() - Matrix3::identity()).norm() < 1e-9);
        assert!((r.determinant() - 1.0).abs() < 1e-9);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]
        #[test]
        fn pose_roundtrips_under_mild_rotations(
            roll in -0.4..0.4f64,
            pitch in -0.4..0.4f64,
            yaw in -0.4..0.4f64,
            tz in 0.6..3.0f64,
        ) {
            let k = CameraIntrinsics::new(800.0, 800.0, 400.0, 300.0);
            let gt_r = nalgebra::Rotation3::from_euler_angles(roll, pitch, yaw).into_inner();
            let gt_t = Vector3::new(0.02, -0.03, tz);
            let tag_size = 0.16;
            let corners = project_corners(&gt_r, &gt_t, &k, tag_size);

            let pose = estimate_pose(&corners, &k, tag_size, false).unwrap();
            prop_assert!((pose.translation() - gt_t).norm() < 1e-3 * tz);
            prop_assert!((pose.rotation() - gt_r).norm() < 1e-2);
        }
    }
}
