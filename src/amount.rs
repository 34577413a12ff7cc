use std::fmt;

const SCALE: i64 = 10_000;

/// Smallest monetary unit (one pesewa/cent) in scaled units.
const CENT: i64 = SCALE / 100;

/// Divide rounding half away from zero.
fn div_round(numerator: i128, denominator: i128) -> i128 {
    let half = denominator / 2;
    if numerator >= 0 {
        (numerator + half) / denominator
    } else {
        (numerator - half) / denominator
    }
}

/// Clamp a widened intermediate back into the `i64` range.
fn saturate(value: i128) -> i64 {
    i64::try_from(value).unwrap_or(if value < 0 { i64::MIN } else { i64::MAX })
}

/// `value` scaled, or `None` when it is not finite or does not fit an `i64`.
fn scale_checked(value: f64) -> Option<i64> {
    let scaled = (value * SCALE as f64).round();
    // i64::MAX as f64 rounds up to 2^63, so the upper bound is exclusive
    (scaled.is_finite() && scaled >= i64::MIN as f64 && scaled < i64::MAX as f64)
        .then_some(scaled as i64)
}

fn write_scaled(f: &mut fmt::Formatter<'_>, value: i64) -> fmt::Result {
    let sign = if value < 0 { "-" } else { "" };
    let abs = value.unsigned_abs();
    let whole = abs / SCALE as u64;
    let frac = abs % SCALE as u64;
    write!(f, "{sign}{whole}.{frac:04}")
}

/// Monetary amount: fixed-point decimal with 4 decimal places, stored as a scaled integer.
///
/// Arithmetic saturates at the `i64` bounds instead of overflowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn from_float(value: f64) -> Self {
        Amount((value * SCALE as f64).round() as i64)
    }

    /// Like [`Amount::from_float`] but rejects NaN, infinities and out-of-range values.
    pub fn try_from_float(value: f64) -> Option<Self> {
        scale_checked(value).map(Amount)
    }

    pub fn from_scaled(value: i64) -> Self {
        Amount(value)
    }

    /// Whole currency units, e.g. `Amount::from_units(20)` is 20.0000.
    pub fn from_units(units: i64) -> Self {
        Amount(units.saturating_mul(SCALE))
    }

    pub fn scaled(self) -> i64 {
        self.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Price of `quantity` units at `self` per unit, rounded to the cent.
    pub fn times(self, quantity: Quantity) -> Amount {
        let raw = div_round(i128::from(self.0) * i128::from(quantity.0), i128::from(SCALE));
        Amount(saturate(raw)).round_cents()
    }

    /// `self * bps / 10_000`, rounded to the cent. 500 bps is 5%.
    pub fn apply_bps(self, bps: u32) -> Amount {
        let raw = div_round(i128::from(self.0) * i128::from(bps), 10_000);
        Amount(saturate(raw)).round_cents()
    }

    pub fn round_cents(self) -> Amount {
        Amount(saturate(div_round(i128::from(self.0), i128::from(CENT)) * i128::from(CENT)))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_scaled(f, self.0)
    }
}

impl std::ops::Add for Amount {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Amount(self.0.saturating_add(rhs.0))
    }
}

impl std::ops::Sub for Amount {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Amount(self.0.saturating_sub(rhs.0))
    }
}

impl std::ops::AddAssign for Amount {
    fn add_assign(&mut self, rhs: Self) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl std::ops::SubAssign for Amount {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 = self.0.saturating_sub(rhs.0);
    }
}

impl std::iter::Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Amount::ZERO, |acc, a| acc + a)
    }
}

/// Product quantity (kg, crates, bunches...), same fixed-point layout as [`Amount`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Quantity(i64);

impl Quantity {
    pub const ZERO: Quantity = Quantity(0);

    pub fn from_float(value: f64) -> Self {
        Quantity((value * SCALE as f64).round() as i64)
    }

    pub fn try_from_float(value: f64) -> Option<Self> {
        scale_checked(value).map(Quantity)
    }

    pub fn from_scaled(value: i64) -> Self {
        Quantity(value)
    }

    pub fn from_units(units: i64) -> Self {
        Quantity(units.saturating_mul(SCALE))
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_scaled(f, self.0)
    }
}

impl std::ops::Add for Quantity {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Quantity(self.0.saturating_add(rhs.0))
    }
}

impl std::ops::Sub for Quantity {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Quantity(self.0.saturating_sub(rhs.0))
    }
}

impl std::ops::AddAssign for Quantity {
    fn add_assign(&mut self, rhs: Self) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl std::ops::SubAssign for Quantity {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 = self.0.saturating_sub(rhs.0);
    }
}
