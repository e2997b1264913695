use crate::error::ValueError;
use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{Signed, ToPrimitive, Zero};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Outcome of exact rational arithmetic: stays in 64 bits when the reduced
/// result fits, widens to big integers otherwise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Exact {
    Rational(Rational),
    BigRational(BigRational),
}

impl Exact {
    pub fn to_big(self) -> BigRational {
        match self {
            Exact::Rational(rational) => rational.to_big(),
            Exact::BigRational(big) => big,
        }
    }

    pub fn to_double(&self) -> f64 {
        match self {
            Exact::Rational(rational) => rational.to_double(),
            Exact::BigRational(big) => big.to_double(),
        }
    }
}

// ─── Rational ─────────────────────────────────────────────────

/// A 64-bit rational. Always stored reduced, with a positive denominator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rational {
    numerator: i64,
    denominator: i64,
}

impl Rational {
    /// Builds a reduced rational. A zero denominator is an error, as is a
    /// reduced value outside the 64-bit range (`i64::MIN / -1`).
    pub fn new(numerator: i64, denominator: i64) -> Result<Self, ValueError> {
        let (numerator, denominator) =
            reduce_i128(i128::from(numerator), i128::from(denominator))?;
        Ok(Self {
            numerator,
            denominator,
        })
    }

    pub fn numerator(&self) -> i64 {
        self.numerator
    }

    pub fn denominator(&self) -> i64 {
        self.denominator
    }

    pub fn negate(self) -> Result<Self, ValueError> {
        if self.numerator == i64::MIN {
            return Err(ValueError::Overflow("rational negation"));
        }
        Ok(Self {
            numerator: -self.numerator,
            denominator: self.denominator,
        })
    }

    pub fn add(self, rhs: Rational) -> Exact {
        self.combine(
            i128::from(self.numerator) * i128::from(rhs.denominator)
                + i128::from(rhs.numerator) * i128::from(self.denominator),
            i128::from(self.denominator) * i128::from(rhs.denominator),
        )
    }

    pub fn subtract(self, rhs: Rational) -> Exact {
        self.combine(
            i128::from(self.numerator) * i128::from(rhs.denominator)
                - i128::from(rhs.numerator) * i128::from(self.denominator),
            i128::from(self.denominator) * i128::from(rhs.denominator),
        )
    }

    pub fn multiply(self, rhs: Rational) -> Exact {
        self.combine(
            i128::from(self.numerator) * i128::from(rhs.numerator),
            i128::from(self.denominator) * i128::from(rhs.denominator),
        )
    }

    pub fn divide(self, rhs: Rational) -> Result<Exact, ValueError> {
        if rhs.numerator == 0 {
            return Err(ValueError::ZeroDenominator);
        }
        Ok(self.combine(
            i128::from(self.numerator) * i128::from(rhs.denominator),
            i128::from(self.denominator) * i128::from(rhs.numerator),
        ))
    }

    pub fn to_double(&self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }

    pub fn to_big(self) -> BigRational {
        BigRational {
            numerator: BigInt::from(self.numerator),
            denominator: BigInt::from(self.denominator),
        }
    }

    fn combine(self, numerator: i128, denominator: i128) -> Exact {
        match reduce_i128(numerator, denominator) {
            Ok((numerator, denominator)) => Exact::Rational(Self {
                numerator,
                denominator,
            }),
            Err(_) => Exact::BigRational(
                BigRational::from_big(BigInt::from(numerator), BigInt::from(denominator))
                    .expect("nonzero denominator"),
            ),
        }
    }
}

/// Reduces and sign-normalizes in 128 bits, then narrows.
fn reduce_i128(numerator: i128, denominator: i128) -> Result<(i64, i64), ValueError> {
    if denominator == 0 {
        return Err(ValueError::ZeroDenominator);
    }
    let (mut numerator, mut denominator) = if denominator < 0 {
        (-numerator, -denominator)
    } else {
        (numerator, denominator)
    };
    if numerator != 0 {
        let divisor = numerator.abs().gcd(&denominator);
        numerator /= divisor;
        denominator /= divisor;
    } else {
        denominator = 1;
    }
    let numerator = i64::try_from(numerator).map_err(|_| ValueError::Overflow("rational"))?;
    let denominator = i64::try_from(denominator).map_err(|_| ValueError::Overflow("rational"))?;
    Ok((numerator, denominator))
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

impl FromStr for Rational {
    type Err = ValueError;

    /// Accepts either `"n"` or `"n/d"`.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim().parse::<i64>().map_err(|_| ValueError::Parse {
                kind: "rational",
                text: text.to_string(),
            })
        };
        match text.split_once('/') {
            Some((numerator, denominator)) => Self::new(parse(numerator)?, parse(denominator)?),
            None => Self::new(parse(text)?, 1),
        }
    }
}

// ─── BigRational ──────────────────────────────────────────────

/// An arbitrary-precision rational. Always stored reduced, with a positive
/// denominator.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BigRational {
    numerator: BigInt,
    denominator: BigInt,
}

impl BigRational {
    pub fn new(numerator: i64, denominator: i64) -> Result<Self, ValueError> {
        Self::from_big(BigInt::from(numerator), BigInt::from(denominator))
    }

    pub fn from_big(numerator: BigInt, denominator: BigInt) -> Result<Self, ValueError> {
        if denominator.is_zero() {
            return Err(ValueError::ZeroDenominator);
        }
        let (mut numerator, mut denominator) = if denominator.is_negative() {
            (-numerator, -denominator)
        } else {
            (numerator, denominator)
        };
        if numerator.is_zero() {
            denominator = BigInt::from(1);
        } else {
            let divisor = numerator.gcd(&denominator);
            numerator /= &divisor;
            denominator /= &divisor;
        }
        Ok(Self {
            numerator,
            denominator,
        })
    }

    pub fn numerator(&self) -> &BigInt {
        &self.numerator
    }

    pub fn denominator(&self) -> &BigInt {
        &self.denominator
    }

    pub fn negate(&self) -> Self {
        Self {
            numerator: -&self.numerator,
            denominator: self.denominator.clone(),
        }
    }

    pub fn add(&self, rhs: &BigRational) -> Self {
        Self::from_big(
            &self.numerator * &rhs.denominator + &rhs.numerator * &self.denominator,
            &self.denominator * &rhs.denominator,
        )
        .expect("nonzero denominator")
    }

    pub fn subtract(&self, rhs: &BigRational) -> Self {
        self.add(&rhs.negate())
    }

    pub fn multiply(&self, rhs: &BigRational) -> Self {
        Self::from_big(
            &self.numerator * &rhs.numerator,
            &self.denominator * &rhs.denominator,
        )
        .expect("nonzero denominator")
    }

    pub fn divide(&self, rhs: &BigRational) -> Result<Self, ValueError> {
        if rhs.numerator.is_zero() {
            return Err(ValueError::ZeroDenominator);
        }
        Self::from_big(
            &self.numerator * &rhs.denominator,
            &self.denominator * &rhs.numerator,
        )
    }

    pub fn to_double(&self) -> f64 {
        let numerator = self.numerator.to_f64().unwrap_or(f64::NAN);
        let denominator = self.denominator.to_f64().unwrap_or(f64::NAN);
        numerator / denominator
    }
}

impl fmt::Display for BigRational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

impl FromStr for BigRational {
    type Err = ValueError;

    /// Accepts either `"n"` or `"n/d"`.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim().parse::<BigInt>().map_err(|_| ValueError::Parse {
                kind: "big rational",
                text: text.to_string(),
            })
        };
        match text.split_once('/') {
            Some((numerator, denominator)) => Self::from_big(parse(numerator)?, parse(denominator)?),
            None => Self::from_big(parse(text)?, BigInt::from(1)),
        }
    }
}
