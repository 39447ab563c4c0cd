//! JSON encoding for complex sample arrays.
//!
//! Samples are written as `[re, im]` pairs. JSON has no NaN, so non-finite components
//! are written as `null` and read back as NaN. Dropped packets leave NaN samples in
//! streams, and they must survive a round trip through storage.

use num_complex::Complex64;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

type Pair = [Option<f64>; 2];

fn to_pair(z: &Complex64) -> Pair {
    let finite = |v: f64| if v.is_finite() { Some(v) } else { None };
    [finite(z.re), finite(z.im)]
}

fn from_pair(p: Pair) -> Complex64 {
    Complex64::new(p[0].unwrap_or(f64::NAN), p[1].unwrap_or(f64::NAN))
}

pub mod vec {
    use super::*;

    pub fn serialize<S: Serializer>(values: &[Complex64], serializer: S) -> Result<S::Ok, S::Error> {
        let pairs: Vec<Pair> = values.iter().map(to_pair).collect();
        pairs.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Complex64>, D::Error> {
        let pairs = Vec::<Pair>::deserialize(deserializer)?;
        Ok(pairs.into_iter().map(from_pair).collect())
    }
}

pub mod matrix {
    use super::*;

    pub fn serialize<S: Serializer>(rows: &[Vec<Complex64>], serializer: S) -> Result<S::Ok, S::Error> {
        let pairs: Vec<Vec<Pair>> = rows.iter().map(|r| r.iter().map(to_pair).collect()).collect();
        pairs.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Vec<Complex64>>, D::Error> {
        let rows = Vec::<Vec<Pair>>::deserialize(deserializer)?;
        Ok(rows
            .into_iter()
            .map(|r| r.into_iter().map(from_pair).collect())
            .collect())
    }
}
