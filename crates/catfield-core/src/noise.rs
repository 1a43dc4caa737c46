//! Seeded 3D simplex noise.
//!
//! [`SimplexNoise`] is a pure function of its input coordinates and a
//! permutation table fixed at construction. Two instances built from the same
//! seed produce bit-identical output, which keeps manifestation jitter
//! reproducible in tests and replays.
//!
//! # Example
//!
//! ```
//! use catfield_core::noise::SimplexNoise;
//!
//! let noise = SimplexNoise::from_seed(42);
//! let v = noise.sample(0.3, 1.7, 4.2);
//! assert!((-1.0..=1.0).contains(&v));
//! assert_eq!(v, SimplexNoise::from_seed(42).sample(0.3, 1.7, 4.2));
//! ```

use rand::Rng;
use rand::SeedableRng;
use rand_pcg::Pcg64;

/// Skew factor for 3D.
const F3: f64 = 1.0 / 3.0;
/// Unskew factor for 3D.
const G3: f64 = 1.0 / 6.0;
/// Output normalisation constant.
const OUTPUT_SCALE: f64 = 32.0;

/// The 12 edge-midpoint gradient directions of a cube.
const GRAD3: [[f64; 3]; 12] = [
    [1.0, 1.0, 0.0],
    [-1.0, 1.0, 0.0],
    [1.0, -1.0, 0.0],
    [-1.0, -1.0, 0.0],
    [1.0, 0.0, 1.0],
    [-1.0, 0.0, 1.0],
    [1.0, 0.0, -1.0],
    [-1.0, 0.0, -1.0],
    [0.0, 1.0, 1.0],
    [0.0, -1.0, 1.0],
    [0.0, 1.0, -1.0],
    [0.0, -1.0, -1.0],
];

// ---------------------------------------------------------------------------
// SimplexNoise
// ---------------------------------------------------------------------------

/// Gradient noise field over three dimensions.
///
/// Construction shuffles a 256-entry permutation with the supplied random
/// source and doubles it to 512 entries so lattice lookups never need a
/// wrap-around. A parallel table holds each entry modulo 12, selecting one of
/// the [`GRAD3`] directions.
#[derive(Clone)]
pub struct SimplexNoise {
    perm: [u8; 512],
    perm_mod12: [u8; 512],
}

impl SimplexNoise {
    /// Build a noise field whose permutation is shuffled by `rng`.
    pub fn new<R: Rng>(rng: &mut R) -> Self {
        let mut p = [0u8; 256];
        for (i, slot) in p.iter_mut().enumerate() {
            *slot = i as u8;
        }
        // Fisher-Yates.
        for i in (1..256).rev() {
            let n = rng.gen_range(0..=i);
            p.swap(i, n);
        }

        let mut perm = [0u8; 512];
        let mut perm_mod12 = [0u8; 512];
        for i in 0..512 {
            perm[i] = p[i & 255];
            perm_mod12[i] = perm[i] % 12;
        }

        Self { perm, perm_mod12 }
    }

    /// Build a noise field from a 64-bit seed using a PCG stream.
    pub fn from_seed(seed: u64) -> Self {
        let mut rng = Pcg64::seed_from_u64(seed);
        Self::new(&mut rng)
    }

    /// Sample the field at `(x, y, z)`. The result lies in `[-1, 1]`.
    pub fn sample(&self, x: f64, y: f64, z: f64) -> f64 {
        // Skew the input space to find the containing simplex cell.
        let s = (x + y + z) * F3;
        let i = (x + s).floor();
        let j = (y + s).floor();
        let k = (z + s).floor();
        let t = (i + j + k) * G3;

        let x0 = x - (i - t);
        let y0 = y - (j - t);
        let z0 = z - (k - t);

        // Pick the tetrahedron the point falls in.
        let (i1, j1, k1, i2, j2, k2) = if x0 >= y0 {
            if y0 >= z0 {
                (1, 0, 0, 1, 1, 0)
            } else if x0 >= z0 {
                (1, 0, 0, 1, 0, 1)
            } else {
                (0, 0, 1, 1, 0, 1)
            }
        } else if y0 < z0 {
            (0, 0, 1, 0, 1, 1)
        } else if x0 < z0 {
            (0, 1, 0, 0, 1, 1)
        } else {
            (0, 1, 0, 1, 1, 0)
        };

        let x1 = x0 - i1 as f64 + G3;
        let y1 = y0 - j1 as f64 + G3;
        let z1 = z0 - k1 as f64 + G3;
        let x2 = x0 - i2 as f64 + 2.0 * G3;
        let y2 = y0 - j2 as f64 + 2.0 * G3;
        let z2 = z0 - k2 as f64 + 2.0 * G3;
        let x3 = x0 - 1.0 + 3.0 * G3;
        let y3 = y0 - 1.0 + 3.0 * G3;
        let z3 = z0 - 1.0 + 3.0 * G3;

        let ii = (i as i64 & 255) as usize;
        let jj = (j as i64 & 255) as usize;
        let kk = (k as i64 & 255) as usize;

        let n0 = self.corner(ii, jj, kk, x0, y0, z0);
        let n1 = self.corner(ii + i1, jj + j1, kk + k1, x1, y1, z1);
        let n2 = self.corner(ii + i2, jj + j2, kk + k2, x2, y2, z2);
        let n3 = self.corner(ii + 1, jj + 1, kk + 1, x3, y3, z3);

        (OUTPUT_SCALE * (n0 + n1 + n2 + n3)).clamp(-1.0, 1.0)
    }

    /// Sample remapped from `[-1, 1]` into `[0, 1]`.
    pub fn sample01(&self, x: f64, y: f64, z: f64) -> f64 {
        (self.sample(x, y, z) + 1.0) * 0.5
    }

    /// Contribution of one simplex corner: radial falloff times the gradient
    /// dot-product.
    #[inline]
    fn corner(&self, i: usize, j: usize, k: usize, x: f64, y: f64, z: f64) -> f64 {
        let t = 0.6 - x * x - y * y - z * z;
        if t < 0.0 {
            return 0.0;
        }
        let gi = self.perm_mod12[i + self.perm[j + self.perm[k] as usize] as usize] as usize;
        let g = GRAD3[gi];
        let t2 = t * t;
        t2 * t2 * (g[0] * x + g[1] * y + g[2] * z)
    }
}

impl std::fmt::Debug for SimplexNoise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimplexNoise")
            .field("perm_head", &&self.perm[..8])
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
