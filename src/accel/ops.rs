//! Elementwise compute functions run by every backend.
//!
//! All of them share one signature, `fn(&[i32], &[i32], &mut [i32])`, over
//! slices of equal length. Device kernels resolve to the same functions, which
//! is what makes CPU and device output bit-identical.

use serde::{Deserialize, Serialize};

/// Signature shared by every compute function.
pub type ComputeFn = fn(&[i32], &[i32], &mut [i32]);

/// Iterations of the trigonometric inner loop in [`heavy_compute`].
const HEAVY_ITERATIONS: i32 = 100;

/// The compute functions a program may expose as entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeOp {
    VecAdd,
    PolynomialOp,
    HeavyCompute,
}

impl ComputeOp {
    pub const ALL: [ComputeOp; 3] = [
        ComputeOp::VecAdd,
        ComputeOp::PolynomialOp,
        ComputeOp::HeavyCompute,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ComputeOp::VecAdd => "vec_add",
            ComputeOp::PolynomialOp => "polynomial_op",
            ComputeOp::HeavyCompute => "heavy_compute",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ComputeOp::VecAdd => "c = a + b",
            ComputeOp::PolynomialOp => "c = 2a^2 + 3a^3 - 4b^2 + 5b^5 (64-bit intermediates)",
            ComputeOp::HeavyCompute => "c = sum over 100 steps of sin(a + j) * cos(b - j)",
        }
    }

    /// Resolve an entry-point name. Accepts the FPGA `krnl_` prefix and the
    /// historical aliases (`vecAdd`, `heavy_compute_kernel`).
    pub fn lookup(name: &str) -> Option<Self> {
        let name = name.strip_prefix("krnl_").unwrap_or(name);
        match name {
            "vec_add" | "vecAdd" | "vadd" => Some(ComputeOp::VecAdd),
            "polynomial_op" => Some(ComputeOp::PolynomialOp),
            "heavy_compute" | "heavy_compute_kernel" => Some(ComputeOp::HeavyCompute),
            _ => None,
        }
    }

    pub fn compute_fn(&self) -> ComputeFn {
        match self {
            ComputeOp::VecAdd => vec_add,
            ComputeOp::PolynomialOp => polynomial_op,
            ComputeOp::HeavyCompute => heavy_compute,
        }
    }

    pub fn apply(&self, a: &[i32], b: &[i32], c: &mut [i32]) {
        debug_assert!(a.len() == b.len() && b.len() == c.len());
        (self.compute_fn())(a, b, c)
    }
}

impl std::fmt::Display for ComputeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.name())
    }
}

impl std::str::FromStr for ComputeOp {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::lookup(s).ok_or_else(|| {
            anyhow::anyhow!(
                "unknown compute function '{}' (supported: vec_add, polynomial_op, heavy_compute)",
                s
            )
        })
    }
}

pub fn vec_add(a: &[i32], b: &[i32], c: &mut [i32]) {
    for ((out, &x), &y) in c.iter_mut().zip(a).zip(b) {
        *out = x.wrapping_add(y);
    }
}

pub fn polynomial_op(a: &[i32], b: &[i32], c: &mut [i32]) {
    for ((out, &x), &y) in c.iter_mut().zip(a).zip(b) {
        let x = x as i64;
        let y = y as i64;

        let a2 = x.wrapping_mul(x);
        let a3 = a2.wrapping_mul(x);
        let b2 = y.wrapping_mul(y);
        let b4 = b2.wrapping_mul(b2);
        let b5 = b4.wrapping_mul(y);

        let result = (2i64.wrapping_mul(a2))
            .wrapping_add(3i64.wrapping_mul(a3))
            .wrapping_sub(4i64.wrapping_mul(b2))
            .wrapping_add(5i64.wrapping_mul(b5));
        *out = result as i32;
    }
}

pub fn heavy_compute(a: &[i32], b: &[i32], c: &mut [i32]) {
    for ((out, &x), &y) in c.iter_mut().zip(a).zip(b) {
        let x = x as f64;
        let y = y as f64;
        let mut acc = 0.0f64;
        for j in 0..HEAVY_ITERATIONS {
            let j = j as f64;
            acc += (x + j).sin() * (y - j).cos();
        }
        *out = acc as i32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_add_scenario() {
        let a: Vec<i32> = (0..8).collect();
        let b: Vec<i32> = (0..8).map(|i| 2 * i).collect();
        let mut c = vec![0; 8];
        vec_add(&a, &b, &mut c);
        assert_eq!(c, vec![0, 3, 6, 9, 12, 15, 18, 21]);
    }

    #[test]
    fn test_polynomial_small_values() {
        // a = 1, b = 2: 2 + 3 - 16 + 160 = 149
        let mut c = [0];
        polynomial_op(&[1], &[2], &mut c);
        assert_eq!(c, [149]);

        let mut c = [0];
        polynomial_op(&[0], &[0], &mut c);
        assert_eq!(c, [0]);
    }

    #[test]
    fn test_polynomial_large_values_do_not_panic() {
        let mut c = [0; 2];
        polynomial_op(&[i32::MAX, i32::MIN], &[i32::MAX, i32::MIN], &mut c);
    }

    #[test]
    fn test_heavy_compute_is_deterministic() {
        let a = [0, 1, 2, 3];
        let b = [0, 2, 4, 6];
        let mut c1 = [0; 4];
        let mut c2 = [0; 4];
        heavy_compute(&a, &b, &mut c1);
        heavy_compute(&a, &b, &mut c2);
        assert_eq!(c1, c2);
    }

    #[test]
    fn test_lookup_aliases() {
        assert_eq!(ComputeOp::lookup("vecAdd"), Some(ComputeOp::VecAdd));
        assert_eq!(ComputeOp::lookup("krnl_polynomial_op"), Some(ComputeOp::PolynomialOp));
        assert_eq!(
            ComputeOp::lookup("heavy_compute_kernel"),
            Some(ComputeOp::HeavyCompute)
        );
        assert_eq!(ComputeOp::lookup("matmul"), None);
        assert!("matmul".parse::<ComputeOp>().is_err());
    }

    #[test]
    fn test_names_round_trip_through_lookup() {
        for op in ComputeOp::ALL {
            assert_eq!(ComputeOp::lookup(op.name()), Some(op));
        }
    }
}
