//! Radix-2 FFT plan and the complex arithmetic the vocoder needs

use std::f32::consts::PI;
use std::ops::{Add, Mul, Sub};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[repr(C)]
pub struct Complex {
    pub re: f32,
    pub im: f32,
}

impl Complex {
    pub const ZERO: Self = Self::new(0.0, 0.0);

    #[inline(always)]
    pub const fn new(re: f32, im: f32) -> Self {
        Self { re, im }
    }

    #[inline(always)]
    pub fn from_polar(magnitude: f32, phase: f32) -> Self {
        let (sin, cos) = phase.sin_cos();
        Self::new(magnitude * cos, magnitude * sin)
    }

    #[inline(always)]
    pub fn magnitude(self) -> f32 {
        fast_sqrt(self.re * self.re + self.im * self.im)
    }

    #[inline(always)]
    pub fn phase(self) -> f32 {
        fast_atan2(self.im, self.re)
    }

    #[inline(always)]
    pub fn conj(self) -> Self {
        Self::new(self.re, -self.im)
    }
}

impl Add for Complex {
    type Output = Self;

    #[inline(always)]
    fn add(self, rhs: Self) -> Self {
        Self::new(self.re + rhs.re, self.im + rhs.im)
    }
}

impl Sub for Complex {
    type Output = Self;

    #[inline(always)]
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.re - rhs.re, self.im - rhs.im)
    }
}

impl Mul for Complex {
    type Output = Self;

    #[inline(always)]
    fn mul(self, rhs: Self) -> Self {
        Self::new(
            self.re * rhs.re - self.im * rhs.im,
            self.re * rhs.im + self.im * rhs.re,
        )
    }
}

/// Precomputed tables for in-place transforms of one power-of-two size
pub struct Fft {
    size: usize,
    /// Forward twiddles e^(-2πik/N); the inverse uses their conjugates
    twiddles: Vec<Complex>,
    bit_rev: Vec<usize>,
}

impl Fft {
    pub fn new(size: usize) -> Self {
        debug_assert!(size.is_power_of_two());
        let bits = size.trailing_zeros();

        let twiddles = (0..size / 2)
            .map(|k| Complex::from_polar(1.0, -2.0 * PI * k as f32 / size as f32))
            .collect();
        let bit_rev = (0..size)
            .map(|i| {
                if bits == 0 {
                    0
                } else {
                    i.reverse_bits() >> (usize::BITS - bits)
                }
            })
            .collect();

        Self {
            size,
            twiddles,
            bit_rev,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Unnormalised forward transform
    pub fn forward(&self, data: &mut [Complex]) {
        self.transform(data, false);
    }

    /// Unnormalised inverse transform (scale by 1/N yourself)
    pub fn inverse(&self, data: &mut [Complex]) {
        self.transform(data, true);
    }

    fn transform(&self, data: &mut [Complex], inverse: bool) {
        let n = self.size;
        debug_assert_eq!(data.len(), n);

        for (i, &j) in self.bit_rev.iter().enumerate() {
            if i < j {
                data.swap(i, j);
            }
        }

        let mut span = 2;
        while span <= n {
            let half = span / 2;
            let stride = n / span;
            for block in data.chunks_exact_mut(span) {
                let (lo, hi) = block.split_at_mut(half);
                for (j, (a, b)) in lo.iter_mut().zip(hi.iter_mut()).enumerate() {
                    let w = self.twiddles[j * stride];
                    let w = if inverse { w.conj() } else { w };
                    let t = *b * w;
                    *b = *a - t;
                    *a = *a + t;
                }
            }
            span *= 2;
        }
    }
}

/// Square root via the inverse-sqrt bit trick and two Newton-Raphson steps
#[inline(always)]
pub(crate) fn fast_sqrt(x: f32) -> f32 {
    if x <= 0.0 {
        return 0.0;
    }
    let y = f32::from_bits(0x5f37_5a86 - (x.to_bits() >> 1));
    let y = y * (1.5 - 0.5 * x * y * y);
    let y = y * (1.5 - 0.5 * x * y * y);
    x * y
}

/// Polynomial atan2, about 0.01 rad worst case
#[inline(always)]
pub(crate) fn fast_atan2(y: f32, x: f32) -> f32 {
    const QUARTER: f32 = PI / 4.0;

    if x == 0.0 {
        return if y == 0.0 { 0.0 } else { PI / 2.0 * y.signum() };
    }

    let abs_y = y.abs() + 1e-10;
    let (r, base) = if x >= 0.0 {
        ((x - abs_y) / (x + abs_y), QUARTER)
    } else {
        ((x + abs_y) / (abs_y - x), 3.0 * QUARTER)
    };
    let angle = base + (0.1963 * r * r - 0.9817) * r;

    if y < 0.0 {
        -angle
    } else {
        angle
    }
}
