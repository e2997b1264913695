use crate::error::ValueError;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

/// A complex number in either of its two interconvertible representations.
///
/// A polar value is kept normalized: the magnitude is non-negative (a
/// negative magnitude flips the sign and turns the angle half a circle) and
/// the angle is folded into (-pi, pi].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Complex {
    Cartesian { real: f64, imaginary: f64 },
    Polar { magnitude: f64, angle: f64 },
}

impl Complex {
    pub fn cartesian(real: f64, imaginary: f64) -> Self {
        Complex::Cartesian { real, imaginary }
    }

    pub fn polar(magnitude: f64, angle: f64) -> Self {
        let (magnitude, angle) = if magnitude < 0.0 {
            (-magnitude, angle + PI)
        } else {
            (magnitude, angle)
        };
        Complex::Polar {
            magnitude,
            angle: fold_angle(angle),
        }
    }

    pub fn is_cartesian(&self) -> bool {
        matches!(self, Complex::Cartesian { .. })
    }

    pub fn real(&self) -> f64 {
        match self {
            Complex::Cartesian { real, .. } => *real,
            Complex::Polar { magnitude, angle } => magnitude * angle.cos(),
        }
    }

    pub fn imaginary(&self) -> f64 {
        match self {
            Complex::Cartesian { imaginary, .. } => *imaginary,
            Complex::Polar { magnitude, angle } => magnitude * angle.sin(),
        }
    }

    pub fn magnitude(&self) -> f64 {
        match self {
            Complex::Cartesian { real, imaginary } => real.hypot(*imaginary),
            Complex::Polar { magnitude, .. } => *magnitude,
        }
    }

    pub fn angle(&self) -> f64 {
        match self {
            Complex::Cartesian { real, imaginary } => imaginary.atan2(*real),
            Complex::Polar { angle, .. } => *angle,
        }
    }

    pub fn to_cartesian(&self) -> Self {
        Complex::Cartesian {
            real: self.real(),
            imaginary: self.imaginary(),
        }
    }

    pub fn to_polar(&self) -> Self {
        Complex::polar(self.magnitude(), self.angle())
    }

    /// Returns a result in the same representation as the receiver.
    fn like_self(&self, real: f64, imaginary: f64) -> Self {
        if self.is_cartesian() {
            Complex::cartesian(real, imaginary)
        } else {
            Complex::polar(real.hypot(imaginary), imaginary.atan2(real))
        }
    }

    pub fn add(&self, rhs: &Complex) -> Self {
        self.like_self(self.real() + rhs.real(), self.imaginary() + rhs.imaginary())
    }

    pub fn subtract(&self, rhs: &Complex) -> Self {
        self.like_self(self.real() - rhs.real(), self.imaginary() - rhs.imaginary())
    }

    pub fn multiply(&self, rhs: &Complex) -> Self {
        let (a, b) = (self.real(), self.imaginary());
        let (c, d) = (rhs.real(), rhs.imaginary());
        self.like_self(a * c - b * d, a * d + b * c)
    }

    pub fn divide(&self, rhs: &Complex) -> Self {
        let (a, b) = (self.real(), self.imaginary());
        let (c, d) = (rhs.real(), rhs.imaginary());
        let scale = c * c + d * d;
        self.like_self((a * c + b * d) / scale, (b * c - a * d) / scale)
    }

    pub fn negate(&self) -> Self {
        self.like_self(-self.real(), -self.imaginary())
    }

    pub fn conjugate(&self) -> Self {
        self.like_self(self.real(), -self.imaginary())
    }

    /// Square root in the magnitude-preserving form, avoiding the
    /// cancellation of the naive half-angle formulas.
    pub fn sqrt(&self) -> Self {
        let (x, y) = (self.real(), self.imaginary());
        if x == 0.0 && y == 0.0 {
            return self.like_self(0.0, 0.0);
        }
        let t = ((x.abs() + x.hypot(y)) / 2.0).sqrt();
        if x >= 0.0 {
            self.like_self(t, y / (2.0 * t))
        } else {
            self.like_self(y.abs() / (2.0 * t), t.copysign(y))
        }
    }

    pub fn exp(&self) -> Self {
        let scale = self.real().exp();
        self.like_self(
            scale * self.imaginary().cos(),
            scale * self.imaginary().sin(),
        )
    }

    pub fn ln(&self) -> Self {
        self.like_self(self.magnitude().ln(), self.angle())
    }

    /// asin(z) = -i ln(iz + sqrt(1 - z^2))
    pub fn asin(&self) -> Self {
        let z = self.to_cartesian();
        let one = Complex::cartesian(1.0, 0.0);
        let i = Complex::cartesian(0.0, 1.0);
        let root = one.subtract(&z.multiply(&z)).sqrt();
        let inner = i.multiply(&z).add(&root).ln();
        self.like_self(inner.imaginary(), -inner.real())
    }

    /// acos(z) = -i ln(z + i sqrt(1 - z^2))
    pub fn acos(&self) -> Self {
        let z = self.to_cartesian();
        let one = Complex::cartesian(1.0, 0.0);
        let i = Complex::cartesian(0.0, 1.0);
        let root = one.subtract(&z.multiply(&z)).sqrt();
        let inner = z.add(&i.multiply(&root)).ln();
        self.like_self(inner.imaginary(), -inner.real())
    }

    /// atan(z) = (i/2) ln((i + z) / (i - z))
    pub fn atan(&self) -> Self {
        let z = self.to_cartesian();
        let i = Complex::cartesian(0.0, 1.0);
        let inner = i.add(&z).divide(&i.subtract(&z)).ln();
        self.like_self(-inner.imaginary() / 2.0, inner.real() / 2.0)
    }
}

/// Folds an angle into (-pi, pi].
fn fold_angle(angle: f64) -> f64 {
    if !angle.is_finite() {
        return angle;
    }
    let folded = angle.rem_euclid(2.0 * PI);
    if folded > PI {
        folded - 2.0 * PI
    } else {
        folded
    }
}

impl fmt::Display for Complex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Complex::Cartesian { real, imaginary } => {
                if imaginary.is_sign_negative() {
                    write!(f, "{real}-{}j", -imaginary)
                } else {
                    write!(f, "{real}+{imaginary}j")
                }
            }
            Complex::Polar { magnitude, angle } => write!(f, "{magnitude} cis {angle}"),
        }
    }
}

impl FromStr for Complex {
    type Err = ValueError;

    /// Recognizes cartesian `"a+bj"` (also `i`) and polar `"r cis theta"`.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let error = || ValueError::Parse {
            kind: "complex",
            text: text.to_string(),
        };
        let parse = |part: &str| part.trim().parse::<f64>().map_err(|_| error());
        let trimmed = text.trim();

        if let Some((magnitude, angle)) = trimmed.split_once("cis") {
            return Ok(Complex::polar(parse(magnitude)?, parse(angle)?));
        }

        let body = trimmed
            .strip_suffix(['j', 'i'])
            .map(|body| (body, true))
            .unwrap_or((trimmed, false));
        let (body, has_imaginary) = body;
        if !has_imaginary {
            return Ok(Complex::cartesian(parse(body)?, 0.0));
        }

        // Split at the sign introducing the imaginary part, skipping a
        // leading sign and exponent signs.
        let split = body
            .char_indices()
            .filter(|(index, c)| {
                *index > 0
                    && (*c == '+' || *c == '-')
                    && !matches!(
                        body[..*index].chars().next_back(),
                        Some('e') | Some('E')
                    )
            })
            .map(|(index, _)| index)
            .last();
        match split {
            Some(index) => {
                let imaginary = match body[index..].trim() {
                    "+" => 1.0,
                    "-" => -1.0,
                    part => parse(part)?,
                };
                Ok(Complex::cartesian(parse(&body[..index])?, imaginary))
            }
            None => {
                let imaginary = match body.trim() {
                    "" | "+" => 1.0,
                    "-" => -1.0,
                    part => parse(part)?,
                };
                Ok(Complex::cartesian(0.0, imaginary))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-12 * (1.0 + a.abs().max(b.abs()))
    }

    #[test]
    fn polar_round_trip_preserves_cartesian() {
        let z = Complex::cartesian(3.0, -4.0);
        let back = z.to_polar().to_cartesian();
        assert!(close(back.real(), 3.0));
        assert!(close(back.imaginary(), -4.0));
    }

    #[test]
    fn polar_normalization() {
        match Complex::polar(-2.0, 0.0) {
            Complex::Polar { magnitude, angle } => {
                assert!(close(magnitude, 2.0));
                assert!(close(angle, PI));
            }
            other => panic!("unexpected representation: {other:?}"),
        }
    }

    #[test]
    fn sqrt_of_negative_real_is_imaginary() {
        let root = Complex::cartesian(-4.0, 0.0).sqrt();
        assert!(close(root.real(), 0.0));
        assert!(close(root.imaginary(), 2.0));
    }

    #[test]
    fn division_inverts_multiplication() {
        let a = Complex::cartesian(1.5, -2.5);
        let b = Complex::cartesian(-0.5, 3.0);
        let quotient = a.multiply(&b).divide(&b);
        assert!(close(quotient.real(), a.real()));
        assert!(close(quotient.imaginary(), a.imaginary()));
    }

    #[test]
    fn parses_cartesian_and_polar_forms() {
        let z = "3+4j".parse::<Complex>().unwrap();
        assert!(close(z.real(), 3.0) && close(z.imaginary(), 4.0));

        let z = "-2.5-1i".parse::<Complex>().unwrap();
        assert!(close(z.real(), -2.5) && close(z.imaginary(), -1.0));

        let z = "4j".parse::<Complex>().unwrap();
        assert!(close(z.real(), 0.0) && close(z.imaginary(), 4.0));

        let z = "2 cis 0.5".parse::<Complex>().unwrap();
        assert!(close(z.magnitude(), 2.0) && close(z.angle(), 0.5));

        assert!("bogus".parse::<Complex>().is_err());
    }

    #[test]
    fn asin_of_half_matches_real_arcsine() {
        let z = Complex::cartesian(0.5, 0.0).asin();
        assert!(close(z.real(), 0.5f64.asin()));
        assert!(close(z.imaginary(), 0.0));
    }
}
